//! Media enrichment of assistant replies (spec.md §4.6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use wsbridge_ws::Inspector;

use crate::envelope;
use crate::store::ContentItem;

pub struct MediaConfig {
    pub directory: PathBuf,
    pub allowed_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
    pub max_age: Duration,
    /// Authoritative total budget for the base64 payload appended to one
    /// message. spec.md's Open Questions flag that the original source uses
    /// the per-file max as a stand-in for this; we take it from the
    /// message-size config instead (documented in DESIGN.md).
    pub total_budget_bytes: u64,
    pub allowed_source_dirs: Vec<PathBuf>,
}

static MEDIA_LINE_PREFIX: &str = "MEDIA:";

fn extract_media_paths(text: &str) -> (String, Vec<String>) {
    let mut paths = Vec::new();
    let mut kept_lines = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(MEDIA_LINE_PREFIX) {
            let candidate = rest.trim();
            if candidate.starts_with('/') && !candidate.contains(char::is_whitespace) {
                paths.push(candidate.to_string());
                continue;
            }
        }
        kept_lines.push(line);
    }
    (kept_lines.join("\n"), paths)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn is_image_mime(mime: &str) -> bool {
    mime.starts_with("image/")
}

async fn path_under_allowed_dirs(path: &Path, allowed: &[PathBuf]) -> Option<PathBuf> {
    let resolved = tokio::fs::canonicalize(path).await.ok()?;
    for dir in allowed {
        if let Ok(dir) = tokio::fs::canonicalize(dir).await {
            if resolved.starts_with(&dir) {
                return Some(resolved);
            }
        }
    }
    None
}

async fn load_as_content_item(
    path: &Path,
    cfg: &MediaConfig,
    budget_remaining: &mut u64,
) -> Option<ContentItem> {
    let ext = extension_of(path)?;
    if !cfg.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
        tracing::warn!(?path, "media: extension not allowlisted");
        return None;
    }
    let resolved = path_under_allowed_dirs(path, &cfg.allowed_source_dirs).await?;
    let metadata = tokio::fs::metadata(&resolved).await.ok()?;
    if metadata.len() > cfg.max_file_size_bytes {
        tracing::warn!(?resolved, "media: file exceeds per-file size limit");
        return None;
    }
    let bytes = tokio::fs::read(&resolved).await.ok()?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    if encoded.len() as u64 > *budget_remaining {
        tracing::warn!(?resolved, "media: cumulative base64 size exceeds total budget");
        return None;
    }
    *budget_remaining -= encoded.len() as u64;

    let mime = mime_for_extension(&ext).to_string();
    let file_name = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);
    if is_image_mime(&mime) {
        Some(ContentItem::Image {
            mime_type: mime,
            content: encoded,
        })
    } else {
        Some(ContentItem::File {
            mime_type: mime,
            content: encoded,
            file_name,
            file_size: Some(bytes.len() as u64),
        })
    }
}

/// Fallback: scan the media directory for recently-modified files passing
/// extension/size checks.
async fn directory_scan_fallback(cfg: &MediaConfig) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(&cfg.directory).await else {
        return out;
    };
    let now = std::time::SystemTime::now();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age <= cfg.max_age {
            out.push(path);
        }
    }
    out
}

/// Shared across all connections: `run_id → first-observed-delta time`.
pub struct MediaInjector {
    config: MediaConfig,
    run_table: Mutex<HashMap<String, Instant>>,
}

impl MediaInjector {
    pub fn new(config: MediaConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            run_table: Mutex::new(HashMap::new()),
        })
    }

    fn note_delta(&self, run_id: &str) {
        let mut table = self.run_table.lock().unwrap();
        let now = Instant::now();
        table.entry(run_id.to_string()).or_insert(now);
        let stale_after = self.config.max_age * 2;
        table.retain(|_, seen| now.duration_since(*seen) < stale_after);
    }

    async fn inject_final(&self, mut value: Value) -> Value {
        let Some(content) = value.pointer("/payload/message/content").cloned() else {
            return value;
        };
        let Some(content_arr) = content.as_array() else {
            return value;
        };

        let mut new_items: Vec<Value> = Vec::new();
        let mut media_paths: Vec<String> = Vec::new();
        for item in content_arr {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
                let (stripped, paths) = extract_media_paths(text);
                media_paths.extend(paths);
                new_items.push(serde_json::json!({ "type": "text", "text": stripped }));
            } else {
                new_items.push(item.clone());
            }
        }

        let mut budget = self.config.total_budget_bytes;
        let mut injected = Vec::new();
        for path in &media_paths {
            if let Some(item) = load_as_content_item(Path::new(path), &self.config, &mut budget).await {
                injected.push(item);
            }
        }

        if injected.is_empty() {
            for path in directory_scan_fallback(&self.config).await {
                if let Some(item) =
                    load_as_content_item(&path, &self.config, &mut budget).await
                {
                    injected.push(item);
                }
            }
        }

        for item in injected {
            if let Ok(v) = serde_json::to_value(&item) {
                new_items.push(v);
            }
        }

        if let Some(message) = value.pointer_mut("/payload/message") {
            if let Some(obj) = message.as_object_mut() {
                obj.insert("content".to_string(), Value::Array(new_items));
            }
        }
        value
    }
}

#[async_trait]
impl Inspector for MediaInjector {
    async fn inspect(&self, text: String) -> Option<String> {
        let Some(value) = envelope::parse(&text) else {
            return Some(text);
        };
        if !envelope::is_chat_event(&value) {
            return Some(text);
        }
        let Some(run_id) = envelope::chat_run_id(&value) else {
            return Some(text);
        };

        match envelope::chat_state(&value) {
            Some("delta") => {
                self.note_delta(run_id);
                // Strip MEDIA: markers from delta text so paths never flash
                // on the client mid-stream.
                let Some(content) = value.pointer("/payload/message/content") else {
                    return Some(text);
                };
                let Some(arr) = content.as_array() else {
                    return Some(text);
                };
                let mut changed = false;
                let mut new_items = Vec::new();
                for item in arr {
                    if item.get("type").and_then(Value::as_str) == Some("text") {
                        let t = item.get("text").and_then(Value::as_str).unwrap_or_default();
                        let (stripped, paths) = extract_media_paths(t);
                        if !paths.is_empty() {
                            changed = true;
                        }
                        new_items.push(serde_json::json!({ "type": "text", "text": stripped }));
                    } else {
                        new_items.push(item.clone());
                    }
                }
                if !changed {
                    return Some(text);
                }
                let mut rewritten = value.clone();
                if let Some(message) = rewritten.pointer_mut("/payload/message") {
                    if let Some(obj) = message.as_object_mut() {
                        obj.insert("content".to_string(), Value::Array(new_items));
                    }
                }
                serde_json::to_string(&rewritten).ok().or(Some(text))
            }
            Some("final") => {
                let rewritten = self.inject_final(value).await;
                serde_json::to_string(&rewritten).ok().or(Some(text))
            }
            _ => Some(text),
        }
    }

    fn name(&self) -> &'static str {
        "media-injector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> MediaConfig {
        MediaConfig {
            directory: dir.to_path_buf(),
            allowed_extensions: vec!["png".to_string(), "txt".to_string()],
            max_file_size_bytes: 1024,
            max_age: Duration::from_secs(60),
            total_budget_bytes: 1_000_000,
            allowed_source_dirs: vec![dir.to_path_buf()],
        }
    }

    #[test]
    fn strips_media_lines() {
        let (stripped, paths) = extract_media_paths("hi\nMEDIA: /tmp/x.png\nbye");
        assert_eq!(stripped, "hi\nbye");
        assert_eq!(paths, vec!["/tmp/x.png".to_string()]);
    }

    #[tokio::test]
    async fn final_injects_image_from_media_marker() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("x.png");
        tokio::fs::write(&file_path, b"abcdefghijkl").await.unwrap();

        let injector = MediaInjector::new(test_config(dir.path()));
        let frame = serde_json::json!({
            "type": "event",
            "event": "chat",
            "payload": {
                "runId": "r1",
                "state": "final",
                "message": {
                    "role": "assistant",
                    "content": [{ "type": "text", "text": format!("hi\nMEDIA: {}", file_path.display()) }],
                },
            },
        });
        let out = injector
            .inspect(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();
        let out_value: Value = serde_json::from_str(&out).unwrap();
        let content = out_value
            .pointer("/payload/message/content")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "hi");
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["mimeType"], "image/png");
    }

    #[tokio::test]
    async fn delta_strips_media_markers() {
        let dir = tempdir().unwrap();
        let injector = MediaInjector::new(test_config(dir.path()));
        let frame = serde_json::json!({
            "type": "event",
            "event": "chat",
            "payload": {
                "runId": "r1",
                "state": "delta",
                "message": {
                    "role": "assistant",
                    "content": [{ "type": "text", "text": "partial\nMEDIA: /etc/passwd" }],
                },
            },
        });
        let out = injector
            .inspect(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();
        assert!(!out.contains("MEDIA:"));
        assert!(out.contains("partial"));
    }

    #[tokio::test]
    async fn rejects_path_outside_allowed_dirs() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let file_path = outside.path().join("x.png");
        tokio::fs::write(&file_path, b"abcdefghijkl").await.unwrap();

        let injector = MediaInjector::new(test_config(dir.path()));
        let frame = serde_json::json!({
            "type": "event",
            "event": "chat",
            "payload": {
                "runId": "r1",
                "state": "final",
                "message": {
                    "role": "assistant",
                    "content": [{ "type": "text", "text": format!("MEDIA: {}", file_path.display()) }],
                },
            },
        });
        let out = injector
            .inspect(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();
        let out_value: Value = serde_json::from_str(&out).unwrap();
        let content = out_value
            .pointer("/payload/message/content")
            .unwrap()
            .as_array()
            .unwrap();
        // the marker is stripped but no image was injected (rejected source dir)
        assert_eq!(content.len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_passes_through() {
        let dir = tempdir().unwrap();
        let injector = MediaInjector::new(test_config(dir.path()));
        let out = injector.inspect("not json".to_string()).await;
        assert_eq!(out, Some("not json".to_string()));
    }

    #[tokio::test]
    async fn directory_scan_fallback_injects_recent_file() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("recent.png"), b"0123456789ab")
            .await
            .unwrap();
        let injector = MediaInjector::new(test_config(dir.path()));
        let frame = serde_json::json!({
            "type": "event",
            "event": "chat",
            "payload": {
                "runId": "r1",
                "state": "final",
                "message": {
                    "role": "assistant",
                    "content": [{ "type": "text", "text": "hi, no markers here" }],
                },
            },
        });
        let out = injector
            .inspect(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();
        let out_value: Value = serde_json::from_str(&out).unwrap();
        let content = out_value
            .pointer("/payload/message/content")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[1]["type"], "image");
    }
}
