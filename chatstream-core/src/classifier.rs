use serde_json::Value;

use crate::stream::Frame;

const TOOL_PREFIX: &str = "mcp_tool_";
const TOOL_ERROR_SUBTYPE: &str = "error";

/// Bare annotation types sent as `{"type": <key>, "data": ...}`.
pub const ANNOTATION_TYPES: [&str; 6] = [
    "context",
    "references",
    "suggestions",
    "conversation_id",
    "annotations",
    "tokenUsage",
];

/// SSE field names other than `data`, which the parser already stripped.
const SSE_FIELDS: [&str; 3] = ["event", "id", "retry"];

/// Classify one non-terminal line into at most one frame.
///
/// Lines that are not JSON fall back to a content delta carrying the raw
/// text, unless they look like a damaged protocol envelope.
pub fn classify(line: &str) -> Option<Frame> {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => classify_value(value),
        Err(e) => {
            if line.trim().is_empty() || looks_like_envelope(line) {
                tracing::debug!(error = %e, len = line.len(), "dropping undecodable envelope line");
                return None;
            }
            tracing::debug!(error = %e, "non-JSON line, treating as plain text");
            Some(Frame::ContentDelta(line.to_string()))
        }
    }
}

fn classify_value(value: Value) -> Option<Frame> {
    let Value::Object(mut obj) = value else {
        tracing::debug!("ignoring JSON line without an object envelope");
        return None;
    };
    let kind = match obj.get("type").and_then(Value::as_str) {
        Some(k) => k.to_string(),
        None => {
            tracing::debug!("ignoring JSON object without a type discriminator");
            return None;
        }
    };
    let data = obj.remove("data");

    match kind.as_str() {
        "error" => Some(Frame::Error {
            message: message_of(data.as_ref(), &["message"])
                .unwrap_or_else(|| "unknown error".to_string()),
        }),
        "chunk" => match data {
            Some(Value::String(text)) => Some(Frame::ContentDelta(text)),
            _ => None,
        },
        "reasoning" => match data {
            Some(Value::String(text)) => Some(Frame::ReasoningDelta(text)),
            _ => None,
        },
        "metadata" => {
            let Some(Value::Object(mut meta)) = obj.remove("metadata") else {
                return None;
            };
            let key = meta.get("type").and_then(Value::as_str)?.to_string();
            let value = meta.remove("data").unwrap_or(Value::Null);
            Some(Frame::Metadata { key, value })
        }
        k if k.starts_with(TOOL_PREFIX) => {
            let subtype = &k[TOOL_PREFIX.len()..];
            let payload = data.unwrap_or(Value::Null);
            if subtype == TOOL_ERROR_SUBTYPE {
                let message = message_of(Some(&payload), &["message", "error"])
                    .unwrap_or_else(|| "tool call failed".to_string());
                Some(Frame::ToolCallError { message, payload })
            } else {
                Some(Frame::ToolCallUpdate {
                    subtype: subtype.to_string(),
                    payload,
                })
            }
        }
        k if ANNOTATION_TYPES.contains(&k) => Some(Frame::Metadata {
            key: kind.clone(),
            value: data.unwrap_or(Value::Null),
        }),
        other => {
            tracing::debug!(frame_type = other, "ignoring unhandled frame type");
            None
        }
    }
}

/// Pull a human-readable message out of `data`: the first string field
/// among `fields`, or `data` itself when it is a bare string.
fn message_of(data: Option<&Value>, fields: &[&str]) -> Option<String> {
    match data? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => fields
            .iter()
            .find_map(|f| map.get(*f).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn looks_like_envelope(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('{') || t.starts_with(':') || is_sse_field(t)
}

/// `event: <name>`, `id: <token>` or `retry: <millis>`. Prose that merely
/// starts with one of these words is not a field line.
fn is_sse_field(line: &str) -> bool {
    SSE_FIELDS.iter().any(|name| {
        let Some(rest) = line.strip_prefix(*name).and_then(|r| r.strip_prefix(':')) else {
            return false;
        };
        let value = rest.strip_prefix(' ').unwrap_or(rest).trim_end();
        if *name == "retry" {
            !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
        } else {
            !value.contains(char::is_whitespace)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_becomes_content_delta() {
        let f = classify(r#"{"type":"chunk","data":"Hel"}"#);
        assert_eq!(f, Some(Frame::ContentDelta("Hel".into())));
    }

    #[test]
    fn chunk_with_non_string_data_is_ignored() {
        assert_eq!(classify(r#"{"type":"chunk","data":{"x":1}}"#), None);
    }

    #[test]
    fn error_frame_message_and_default() {
        let f = classify(r#"{"type":"error","data":{"message":"quota"}}"#);
        assert_eq!(
            f,
            Some(Frame::Error {
                message: "quota".into()
            })
        );
        let f = classify(r#"{"type":"error"}"#);
        assert_eq!(
            f,
            Some(Frame::Error {
                message: "unknown error".into()
            })
        );
    }

    #[test]
    fn nested_metadata_is_keyed_by_inner_type() {
        let f = classify(r#"{"type":"metadata","metadata":{"type":"references","data":[1,2]}}"#);
        assert_eq!(
            f,
            Some(Frame::Metadata {
                key: "references".into(),
                value: json!([1, 2])
            })
        );
    }

    #[test]
    fn metadata_without_inner_type_is_ignored() {
        assert_eq!(classify(r#"{"type":"metadata","metadata":{"data":1}}"#), None);
        assert_eq!(classify(r#"{"type":"metadata","metadata":"x"}"#), None);
    }

    #[test]
    fn reasoning_delta() {
        let f = classify(r#"{"type":"reasoning","data":"think"}"#);
        assert_eq!(f, Some(Frame::ReasoningDelta("think".into())));
    }

    #[test]
    fn tool_frames_route_by_subtype() {
        let f = classify(r#"{"type":"mcp_tool_call","data":{"id":"t1","name":"search"}}"#);
        assert_eq!(
            f,
            Some(Frame::ToolCallUpdate {
                subtype: "call".into(),
                payload: json!({"id":"t1","name":"search"})
            })
        );

        let f = classify(r#"{"type":"mcp_tool_error","data":{"id":"t1","error":"timeout"}}"#);
        match f {
            Some(Frame::ToolCallError { message, payload }) => {
                assert_eq!(message, "timeout");
                assert_eq!(payload["id"], json!("t1"));
            }
            other => panic!("expected ToolCallError, got {other:?}"),
        }
    }

    #[test]
    fn bare_annotations_become_metadata() {
        for key in ANNOTATION_TYPES {
            let line = json!({"type": key, "data": {"k": key}}).to_string();
            match classify(&line) {
                Some(Frame::Metadata { key: k, value }) => {
                    assert_eq!(k, key);
                    assert_eq!(value, json!({"k": key}));
                }
                other => panic!("expected metadata for {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_and_untyped_json_is_ignored() {
        assert_eq!(classify(r#"{"type":"heartbeat"}"#), None);
        assert_eq!(classify(r#"{"data":"x"}"#), None);
        assert_eq!(classify("42"), None);
    }

    #[test]
    fn plain_text_falls_back_to_content() {
        assert_eq!(
            classify("plain text"),
            Some(Frame::ContentDelta("plain text".into()))
        );
    }

    #[test]
    fn damaged_envelopes_do_not_leak_into_content() {
        assert_eq!(classify(r#"{"type":"chunk","da"#), None);
        assert_eq!(classify("event: message"), None);
        assert_eq!(classify(": keep-alive"), None);
        assert_eq!(classify("retry: 3000"), None);
        assert_eq!(classify("   "), None);
        assert_eq!(classify("id: 7f3a"), None);
    }

    #[test]
    fn prose_starting_with_field_names_is_content() {
        for line in ["id: 5 apples", "event: the launch went fine", "retry: later"] {
            assert_eq!(
                classify(line),
                Some(Frame::ContentDelta(line.into())),
                "{line}"
            );
        }
    }
}
