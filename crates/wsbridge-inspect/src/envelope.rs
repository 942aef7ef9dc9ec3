//! Loose JSON-shape helpers for the protocol envelopes named in spec.md §6.
//!
//! Every inspector must fail open on malformed or unrecognized input
//! (spec.md §7), so parsing here returns `Option`/`Result` liberally instead
//! of hard `serde` structs that would reject frames with extra or missing
//! fields the sender is entitled to include.

use serde_json::Value;

pub fn parse(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

pub fn is_req_method(v: &Value, method: &str) -> bool {
    v.get("type").and_then(Value::as_str) == Some("req")
        && v.get("method").and_then(Value::as_str) == Some(method)
}

pub fn req_method(v: &Value) -> Option<&str> {
    if v.get("type").and_then(Value::as_str) != Some("req") {
        return None;
    }
    v.get("method").and_then(Value::as_str)
}

pub fn req_id(v: &Value) -> Option<String> {
    v.get("id").map(|id| match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

pub fn is_chat_event(v: &Value) -> bool {
    v.get("type").and_then(Value::as_str) == Some("event")
        && v.get("event").and_then(Value::as_str) == Some("chat")
}

pub fn chat_state<'a>(v: &'a Value) -> Option<&'a str> {
    v.pointer("/payload/state").and_then(Value::as_str)
}

pub fn chat_run_id<'a>(v: &'a Value) -> Option<&'a str> {
    v.pointer("/payload/runId").and_then(Value::as_str)
}

pub fn chat_role<'a>(v: &'a Value) -> Option<&'a str> {
    v.pointer("/payload/message/role").and_then(Value::as_str)
}

pub fn chat_session_key<'a>(v: &'a Value) -> Option<&'a str> {
    v.pointer("/payload/sessionKey").and_then(Value::as_str)
}

pub fn history_response(id: Option<&str>, messages: Value) -> Value {
    serde_json::json!({
        "type": "res",
        "id": id,
        "payload": { "messages": messages },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_req_method() {
        let v = parse(r#"{"type":"req","method":"chat.send","id":"1"}"#).unwrap();
        assert!(is_req_method(&v, "chat.send"));
        assert_eq!(req_method(&v), Some("chat.send"));
        assert_eq!(req_id(&v), Some("1".to_string()));
    }

    #[test]
    fn recognizes_chat_event() {
        let v = parse(
            r#"{"type":"event","event":"chat","payload":{"runId":"r1","state":"final","message":{"role":"assistant"}}}"#,
        )
        .unwrap();
        assert!(is_chat_event(&v));
        assert_eq!(chat_state(&v), Some("final"));
        assert_eq!(chat_run_id(&v), Some("r1"));
        assert_eq!(chat_role(&v), Some("assistant"));
    }

    #[test]
    fn malformed_json_parses_to_none() {
        assert!(parse("not json").is_none());
    }
}
