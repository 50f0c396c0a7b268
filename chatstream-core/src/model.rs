use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Loading,
    Active,
    Completed,
    Failed,
}

impl MessageStatus {
    /// Loading or active: the message can still change.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Loading | Self::Active)
    }
}

/// Accumulated "thinking" text with wall-clock timestamps in epoch milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningTrace {
    pub content: String,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl ReasoningTrace {
    pub fn started_at(start_time: i64) -> Self {
        Self {
            content: String::new(),
            start_time,
            end_time: None,
            duration: None,
        }
    }

    /// Close the trace. `duration` is only ever computed here, and only once.
    pub fn close(&mut self, now_ms: i64) {
        if self.duration.is_some() {
            return;
        }
        let end = *self.end_time.get_or_insert(now_ms);
        self.duration = Some((end - self.start_time).max(0));
    }
}

/// One invoked tool, correlated across update frames by `id`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    /// Last frame subtype seen for this call, e.g. `call` or `result` for `mcp_tool_result`.
    pub phase: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<ReasoningTrace>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub created_at: i64,
}

impl ChatMessage {
    fn new(role: Role, content: String, status: MessageStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            status,
            reasoning_trace: None,
            tool_calls: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now_ms(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into(), MessageStatus::Completed)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into(), MessageStatus::Completed)
    }

    /// Empty assistant message waiting for its first frame.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new(), MessageStatus::Loading)
    }

    /// The in-progress UI artifact that must never be sent upstream.
    pub fn is_pending_placeholder(&self) -> bool {
        self.role == Role::Assistant
            && self.status == MessageStatus::Loading
            && self.content.is_empty()
    }

    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|t| t.id == id)
    }
}

/// `{role, content}` pair as it goes on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_serializes_camel_case() {
        let mut msg = ChatMessage::assistant_placeholder();
        msg.reasoning_trace = Some(ReasoningTrace::started_at(10));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], json!("assistant"));
        assert_eq!(v["status"], json!("loading"));
        assert_eq!(v["reasoningTrace"]["startTime"], json!(10));
        assert!(v["reasoningTrace"].get("endTime").is_none());
        assert!(v["toolCalls"].as_array().unwrap().is_empty());
    }

    #[test]
    fn tool_call_fields_flatten() {
        let mut fields = Map::new();
        fields.insert("name".into(), json!("search"));
        let call = ToolCall {
            id: "t1".into(),
            phase: "call".into(),
            fields,
        };
        let v = serde_json::to_value(&call).unwrap();
        assert_eq!(v, json!({"id":"t1","phase":"call","name":"search"}));
    }

    #[test]
    fn reasoning_close_computes_duration_once() {
        let mut trace = ReasoningTrace::started_at(1_000);
        trace.close(1_250);
        assert_eq!(trace.end_time, Some(1_250));
        assert_eq!(trace.duration, Some(250));

        trace.close(9_999);
        assert_eq!(trace.end_time, Some(1_250));
        assert_eq!(trace.duration, Some(250));
    }

    #[test]
    fn placeholder_detection() {
        let mut msg = ChatMessage::assistant_placeholder();
        assert!(msg.is_pending_placeholder());
        msg.content.push('x');
        assert!(!msg.is_pending_placeholder());
        assert!(!ChatMessage::user("").is_pending_placeholder());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ChatMessage::user("a").id, ChatMessage::user("a").id);
    }
}
