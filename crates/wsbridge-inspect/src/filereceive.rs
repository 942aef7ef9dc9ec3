//! Client→upstream attachment interception (spec.md §4.8).
//!
//! Fires on `chat.send` requests carrying `params.attachments`, writes any
//! `type:"file"` entry to disk under the inbox directory, and replaces the
//! request's `content` field with a `FILE_RECEIVED:` marker so the Gateway
//! never sees the raw base64 payload.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use wsbridge_ws::Inspector;

use crate::envelope;

pub struct FileReceiveConfig {
    pub inbox_dir: PathBuf,
}

/// Strips path separators and leading dots so the stored name can never
/// escape the inbox directory or collide with a dotfile.
fn sanitize_filename(raw: &str) -> String {
    let base = Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment");
    let mut cleaned: String = base
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    while cleaned.starts_with('.') {
        cleaned.remove(0);
    }
    if cleaned.is_empty() {
        cleaned = "attachment".to_string();
    }
    cleaned
}

async fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return candidate;
    }
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), format!(".{e}")),
        None => (filename.to_string(), String::new()),
    };
    dir.join(format!("{stem}_{millis}{ext}"))
}

async fn write_attachment(dir: &Path, filename: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let dest = unique_destination(dir, filename).await;
    let tmp = dest.with_extension("part");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &dest).await?;
    Ok(dest)
}

pub struct FileReceiveInspector {
    config: FileReceiveConfig,
}

impl FileReceiveInspector {
    pub fn new(config: FileReceiveConfig) -> Self {
        Self { config }
    }

    async fn handle(&self, value: Value) -> String {
        let original = serde_json::to_string(&value).unwrap_or_default();
        let Some(attachments) = value.pointer("/params/attachments").and_then(Value::as_array) else {
            return original;
        };

        let mut markers = Vec::new();
        for attachment in attachments {
            if attachment.get("type").and_then(Value::as_str) != Some("file") {
                continue;
            }
            let Some(content) = attachment.get("content").and_then(Value::as_str) else {
                continue;
            };
            let mime = attachment
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream");
            let name = attachment
                .get("fileName")
                .and_then(Value::as_str)
                .unwrap_or("attachment");
            let filename = sanitize_filename(name);

            let bytes = match base64::engine::general_purpose::STANDARD.decode(content) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "file-receive: failed to decode attachment");
                    continue;
                }
            };
            match write_attachment(&self.config.inbox_dir, &filename, &bytes).await {
                Ok(dest) => {
                    markers.push(format!(
                        "FILE_RECEIVED: {} ({}, {} bytes)",
                        dest.display(),
                        mime,
                        bytes.len()
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "file-receive: failed to persist attachment");
                }
            }
        }

        if markers.is_empty() {
            return original;
        }

        let mut rewritten = value;
        if let Some(params) = rewritten.get_mut("params").and_then(Value::as_object_mut) {
            let mut message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            for marker in &markers {
                if !message.is_empty() {
                    message.push('\n');
                }
                message.push_str(marker);
            }
            params.insert("message".to_string(), Value::String(message));
            if let Some(attachments) = params.get_mut("attachments").and_then(Value::as_array_mut) {
                for attachment in attachments.iter_mut() {
                    if let Some(obj) = attachment.as_object_mut() {
                        obj.remove("content");
                    }
                }
            }
        }
        serde_json::to_string(&rewritten).unwrap_or(original)
    }
}

#[async_trait]
impl Inspector for FileReceiveInspector {
    async fn inspect(&self, text: String) -> Option<String> {
        let Some(value) = envelope::parse(&text) else {
            return Some(text);
        };
        if envelope::req_method(&value) != Some("chat.send") {
            return Some(text);
        }
        Some(self.handle(value).await)
    }

    fn name(&self) -> &'static str {
        "file-receive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn b64(data: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    #[test]
    fn sanitizes_path_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..hidden"), "hidden");
        assert_eq!(sanitize_filename("a/b/c.txt"), "c.txt");
    }

    #[tokio::test]
    async fn writes_attachment_and_rewrites_message() {
        let dir = tempdir().unwrap();
        let inspector = FileReceiveInspector::new(FileReceiveConfig {
            inbox_dir: dir.path().to_path_buf(),
        });
        let frame = serde_json::json!({
            "type": "req",
            "method": "chat.send",
            "id": "1",
            "params": {
                "message": "here",
                "attachments": [{
                    "type": "file",
                    "fileName": "report.txt",
                    "mimeType": "text/plain",
                    "content": b64("hello world"),
                }],
            },
        });
        let out = inspector
            .inspect(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();
        let out_value: Value = serde_json::from_str(&out).unwrap();
        let message = out_value["params"]["message"].as_str().unwrap();
        assert!(message.contains("FILE_RECEIVED:"));
        assert!(message.contains("report.txt"));
        assert!(out_value["params"]["attachments"][0].get("content").is_none());

        let written = tokio::fs::read(dir.path().join("report.txt")).await.unwrap();
        assert_eq!(written, b"hello world");
    }

    #[tokio::test]
    async fn collision_gets_unique_suffix() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("report.txt"), b"existing")
            .await
            .unwrap();
        let inspector = FileReceiveInspector::new(FileReceiveConfig {
            inbox_dir: dir.path().to_path_buf(),
        });
        let frame = serde_json::json!({
            "type": "req",
            "method": "chat.send",
            "params": {
                "attachments": [{
                    "type": "file",
                    "fileName": "report.txt",
                    "content": b64("new"),
                }],
            },
        });
        inspector
            .inspect(serde_json::to_string(&frame).unwrap())
            .await;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn non_chat_send_passes_through_untouched() {
        let dir = tempdir().unwrap();
        let inspector = FileReceiveInspector::new(FileReceiveConfig {
            inbox_dir: dir.path().to_path_buf(),
        });
        let out = inspector
            .inspect(r#"{"type":"req","method":"sessions.history"}"#.to_string())
            .await;
        assert_eq!(out, Some(r#"{"type":"req","method":"sessions.history"}"#.to_string()));
    }

    #[tokio::test]
    async fn bad_base64_is_skipped_fail_open() {
        let dir = tempdir().unwrap();
        let inspector = FileReceiveInspector::new(FileReceiveConfig {
            inbox_dir: dir.path().to_path_buf(),
        });
        let frame = serde_json::json!({
            "type": "req",
            "method": "chat.send",
            "params": {
                "message": "hi",
                "attachments": [{ "type": "file", "fileName": "x.txt", "content": "not-base64!!" }],
            },
        });
        let input = serde_json::to_string(&frame).unwrap();
        let out = inspector.inspect(input.clone()).await;
        assert_eq!(out, Some(input));
    }
}
