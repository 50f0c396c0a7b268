//! Turn-level telemetry.
//! Nothing is recorded unless a sink is handed to the session with
//! `ChatSession::with_telemetry`.

pub mod types;
#[cfg(test)]
pub mod test_span;

pub use types::*;

/// Implement this to receive one summary per finished turn.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`).
/// - `record_turn` runs on the session's task; keep it cheap and never panic.
pub trait TelemetrySink: Send + Sync {
    fn record_turn(&self, log: TurnLog);
}
