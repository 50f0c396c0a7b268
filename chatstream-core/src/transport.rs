use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{ChatError, CoreResult};

/// Everything the transport needs to open one streaming turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StartChatRequest {
    pub url: String,
    pub method: http::Method,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    pub timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub max_retry_count: u32,
}

/// Transport lifecycle callbacks, delivered as a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    /// Text aligned on line boundaries; may hold several lines.
    Message { data: String, event: Option<String> },
    Error(String),
    Finish,
    RetryLimitExceeded,
}

impl TransportEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self::Message {
            data: data.into(),
            event: None,
        }
    }
}

pub type TransportStream = BoxStream<'static, TransportEvent>;

/// Network side of a chat session. Owns reconnection, heartbeat detection
/// and retry; the session only reacts to the events it yields.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn start_chat(&self, req: StartChatRequest) -> CoreResult<TransportStream>;
    /// Abort the current stream, if any. Must be safe to call repeatedly.
    fn stop_chat(&self);
}

/// Transport that replays queued event streams, one per `start_chat`.
/// Used for offline replay and in tests.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<TransportStream>>,
    requests: Mutex<Vec<StartChatRequest>>,
    stops: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fixed list of events for the next turn.
    pub fn push_events(&self, events: Vec<TransportEvent>) {
        self.push_stream(futures::stream::iter(events).boxed());
    }

    /// Queue an arbitrary stream, e.g. one fed by a channel.
    pub fn push_stream(&self, stream: TransportStream) {
        if let Ok(mut q) = self.scripts.lock() {
            q.push_back(stream);
        }
    }

    /// Queue `Open`, one `Message` per line of `recording`, then `Finish`.
    pub fn push_recording(&self, recording: &str) {
        let mut events = vec![TransportEvent::Open];
        events.extend(
            recording
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(TransportEvent::message),
        );
        events.push(TransportEvent::Finish);
        self.push_events(events);
    }

    pub fn requests(&self) -> Vec<StartChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start_chat(&self, req: StartChatRequest) -> CoreResult<TransportStream> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(req);
        }
        self.scripts
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .ok_or_else(|| ChatError::Transport("no scripted stream queued".into()))
    }

    fn stop_chat(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
