//! Notification rate limiting for streaming updates.
//!
//! The scheduler owns a single debounce deadline rather than a timer task;
//! the session's event loop sleeps until [`UpdateScheduler::deadline`] and
//! then calls [`UpdateScheduler::poll_due`]. The snapshot is taken at flush
//! time, so a flush never publishes a stale copy.

use std::time::Duration;

use tokio::time::Instant;

/// Default debounce window for content deltas.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Structural change or first delta: notify now.
    Immediate,
    /// High-frequency delta: coalesce.
    Debounced,
    /// Finalization: drop any pending flush, then notify now.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    NotifyNow,
    Deferred,
}

#[derive(Debug)]
pub struct UpdateScheduler {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl UpdateScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Decide how to announce a change of the given kind.
    ///
    /// An immediate notification carries the latest state, so it also
    /// discards a pending flush that would only repeat it.
    pub fn route(&mut self, kind: UpdateKind, now: Instant) -> Dispatch {
        match kind {
            UpdateKind::Debounced => {
                self.debounce(now);
                Dispatch::Deferred
            }
            UpdateKind::Immediate | UpdateKind::Terminal => {
                self.cancel();
                Dispatch::NotifyNow
            }
        }
    }

    /// Start the window, replacing any pending one.
    pub fn debounce(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true exactly once when the pending window has elapsed.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the pending flush without notifying. Returns whether one existed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn burst_within_window_flushes_once() {
        let t0 = Instant::now();
        let mut s = UpdateScheduler::new(ms(50));
        for i in 0..5 {
            assert_eq!(s.route(UpdateKind::Debounced, t0 + ms(i * 5)), Dispatch::Deferred);
        }
        // window restarts on every delta, so it ends 50ms after the last one
        assert!(!s.poll_due(t0 + ms(60)));
        assert!(s.poll_due(t0 + ms(70)));
        assert!(!s.poll_due(t0 + ms(200)));
    }

    #[test]
    fn only_one_deadline_at_a_time() {
        let t0 = Instant::now();
        let mut s = UpdateScheduler::new(ms(50));
        s.debounce(t0);
        s.debounce(t0 + ms(30));
        assert_eq!(s.deadline(), Some(t0 + ms(80)));
    }

    #[test]
    fn immediate_and_terminal_clear_pending() {
        let t0 = Instant::now();
        let mut s = UpdateScheduler::new(ms(50));
        s.route(UpdateKind::Debounced, t0);
        assert_eq!(s.route(UpdateKind::Immediate, t0), Dispatch::NotifyNow);
        assert!(!s.is_pending());

        s.route(UpdateKind::Debounced, t0);
        assert_eq!(s.route(UpdateKind::Terminal, t0), Dispatch::NotifyNow);
        assert!(!s.poll_due(t0 + ms(100)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let t0 = Instant::now();
        let mut s = UpdateScheduler::default();
        assert_eq!(s.delay(), DEFAULT_DEBOUNCE);
        s.debounce(t0);
        assert!(s.cancel());
        assert!(!s.cancel());
        assert!(!s.poll_due(t0 + ms(1_000)));
    }
}
