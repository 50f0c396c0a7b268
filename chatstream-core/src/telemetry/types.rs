use serde::{Deserialize, Serialize};

/// How a turn ended, as reported to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Failed,
    Stopped,
}

impl TurnOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Structured summary of one streamed turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnLog {
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub outcome: Option<TurnOutcome>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,

    pub started_at_ms: Option<i64>,
    pub latency_ms: Option<u64>,
    pub content_len: usize,
    pub reasoning_ms: Option<i64>,
    pub tool_calls: usize,

    /// Lines received, frames applied, and UI notifications emitted.
    pub lines: usize,
    pub frames: usize,
    pub notifications: usize,
}

impl TurnLog {
    pub fn new() -> Self { Self::default() }
    pub fn conversation_id_opt(mut self, v: Option<&str>) -> Self { self.conversation_id = v.map(|s| s.to_string()); self }
    pub fn message_id_opt(mut self, v: Option<&str>) -> Self { self.message_id = v.map(|s| s.to_string()); self }
    pub fn outcome(mut self, v: TurnOutcome) -> Self { self.outcome = Some(v); self }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
    pub fn started_at_ms(mut self, v: i64) -> Self { self.started_at_ms = Some(v); self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn content_len(mut self, v: usize) -> Self { self.content_len = v; self }
    pub fn reasoning_ms_opt(mut self, v: Option<i64>) -> Self { self.reasoning_ms = v; self }
    pub fn tool_calls(mut self, v: usize) -> Self { self.tool_calls = v; self }
    pub fn counts(mut self, lines: usize, frames: usize, notifications: usize) -> Self {
        self.lines = lines; self.frames = frames; self.notifications = notifications; self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_log_serializes() {
        let log = TurnLog::new()
            .conversation_id_opt(Some("conv-1"))
            .message_id_opt(Some("msg-1"))
            .outcome(TurnOutcome::Failed)
            .error("protocol", "overloaded")
            .latency_ms(42)
            .counts(3, 2, 1);

        let v = serde_json::to_value(&log).unwrap();
        assert_eq!(v["conversation_id"], json!("conv-1"));
        assert_eq!(v["outcome"], json!("failed"));
        assert_eq!(v["error_kind"], json!("protocol"));
        assert_eq!(v["latency_ms"], json!(42));
        assert_eq!(v["notifications"], json!(1));
    }
}
