use thiserror::Error;

/// Core error type for chatstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Explicit `{"type":"error"}` frame sent by the backend.
    #[error("stream error: {0}")]
    Protocol(String),

    #[error("tool call failed: {0}")]
    ToolCall(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("retry limit exceeded")]
    RetryExhausted,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatError {
    /// Returns true if this error ends the current turn.
    /// Tool failures are reported but generation keeps going.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ToolCall(_) | Self::Validation(_))
    }

    /// Short, stable name used in logs and turn telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Protocol(_) => "protocol",
            Self::ToolCall(_) => "tool_call",
            Self::Transport(_) => "transport",
            Self::RetryExhausted => "retry_exhausted",
            Self::Unauthorized(_) => "unauthorized",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatError>;
