//! Frame vocabulary of the chat streaming protocol.
//!
//! Contract:
//! - A turn carries 0..n non-terminal frames (content, reasoning, metadata, tool calls).
//! - The stream ends with exactly one terminal frame: `Done` or `Error`.
//! - Frames after a terminal frame are ignored by the assembler.

use serde_json::Value;

/// One semantically classified unit of the stream.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Assistant text delta. Also produced for undecodable plain-text lines.
    ContentDelta(String),
    /// Annotation merged into `metadata` under `key`.
    Metadata { key: String, value: Value },
    /// Reasoning ("thinking") text delta.
    ReasoningDelta(String),
    /// `mcp_tool_<subtype>` update for a single tool call.
    ToolCallUpdate { subtype: String, payload: Value },
    /// `mcp_tool_error`; reported, not fatal.
    ToolCallError { message: String, payload: Value },
    /// Backend-reported failure; ends the turn.
    Error { message: String },
    /// `[DONE]` sentinel.
    Done,
}

impl Frame {
    /// Returns true if this frame ends the stream (`Done` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContentDelta(_) => "content-delta",
            Self::Metadata { .. } => "metadata",
            Self::ReasoningDelta(_) => "reasoning-delta",
            Self::ToolCallUpdate { .. } => "tool-call-update",
            Self::ToolCallError { .. } => "tool-call-error",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_done_and_error_end_the_stream() {
        assert!(Frame::Done.is_terminal());
        assert!(
            Frame::Error {
                message: "x".into()
            }
            .is_terminal()
        );
        let tool_error = Frame::ToolCallError {
            message: "x".into(),
            payload: Value::Null,
        };
        assert!(!tool_error.is_terminal());
        assert_eq!(tool_error.kind(), "tool-call-error");
        assert!(!Frame::ContentDelta("hi".into()).is_terminal());
    }
}
