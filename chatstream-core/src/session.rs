//! Turn orchestration: history, request bodies, transport lifecycle and the
//! parse → classify → assemble → notify pipeline.
//!
//! All state lives on one `ChatSession` and is mutated from one task. The
//! transport callbacks (`on_open`, `on_message`, ...) are plain synchronous
//! methods; `append`/`reload` drive them from the transport's event stream
//! and sleep on the scheduler's debounce deadline in between.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::field::Empty;
use tracing_futures::Instrument;

use crate::assembler::{Applied, MessageAssembler, Outcome};
use crate::auth::{AuthContext, is_auth_failure};
use crate::classifier::classify;
use crate::config::SessionConfig;
use crate::error::{ChatError, CoreResult};
use crate::model::{ChatMessage, Role, WireMessage, now_ms};
use crate::normalizer::normalize_input;
use crate::parser::{ParsedLine, parse_chunk};
use crate::scheduler::{Dispatch, UpdateKind, UpdateScheduler};
use crate::stream::Frame;
use crate::telemetry::{TelemetrySink, TurnLog, TurnOutcome};
use crate::transport::{ChatTransport, StartChatRequest, TransportEvent, TransportStream};

const CONVERSATION_ID_KEYS: [&str; 2] = ["conversation_id", "conversationId"];

/// Public lifecycle of the session as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ready,
    /// Request sent, nothing received yet.
    Submitted,
    Streaming,
    /// Last turn failed; see [`ChatSession::error`].
    Error,
}

/// Receives UI-facing notifications. Messages are clones of the live state.
pub trait UpdateSink: Send + Sync {
    fn message_updated(&self, message: ChatMessage);
    fn error(&self, _err: &ChatError) {}
    fn status_changed(&self, _status: SessionStatus) {}
}

/// Whether the event loop should keep reading the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Cloneable trigger that stops the running turn from another task.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

enum TurnEnd {
    Completed,
    Stopped,
    Failed(ChatError),
}

#[derive(Default)]
struct TurnStats {
    span: Option<tracing::Span>,
    started: Option<Instant>,
    started_at_ms: i64,
    lines: usize,
    frames: usize,
    notifications: usize,
}

pub struct ChatSession {
    config: SessionConfig,
    transport: Arc<dyn ChatTransport>,
    auth: Arc<dyn AuthContext>,
    sink: Arc<dyn UpdateSink>,
    telemetry: Option<Arc<dyn TelemetrySink>>,

    /// Chronological history; the in-flight message lives in the assembler.
    messages: Vec<ChatMessage>,
    assembler: MessageAssembler,
    scheduler: UpdateScheduler,

    status: SessionStatus,
    error: Option<String>,
    conversation_id: Option<String>,
    extra_body: Map<String, Value>,

    stop_tx: Arc<watch::Sender<bool>>,
    stats: TurnStats,
    last_outcome: Option<TurnOutcome>,
}

impl ChatSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn ChatTransport>,
        auth: Arc<dyn AuthContext>,
        sink: Arc<dyn UpdateSink>,
    ) -> Self {
        let scheduler = UpdateScheduler::new(config.stream.debounce());
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            transport,
            auth,
            sink,
            telemetry: None,
            messages: Vec::new(),
            assembler: MessageAssembler::new(),
            scheduler,
            status: SessionStatus::Ready,
            error: None,
            conversation_id: None,
            extra_body: Map::new(),
            stop_tx: Arc::new(stop_tx),
            stats: TurnStats::default(),
            last_outcome: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Text of the last surfaced error, cleared when a new turn starts.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn set_conversation_id(&mut self, id: Option<String>) {
        self.conversation_id = id;
    }

    /// Fields merged last into every request body.
    pub fn set_extra_body(&mut self, extra: Map<String, Value>) {
        self.extra_body = extra;
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn messages_newest_first(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().rev()
    }

    /// The assistant message currently being assembled, if any.
    pub fn in_flight(&self) -> Option<&ChatMessage> {
        self.assembler.current()
    }

    /// Replace the history wholesale. A running turn is stopped first.
    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.stop();
        self.messages = messages;
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }

    /// Normalize user input and run a turn with it.
    pub async fn handle_submit(&mut self, text: &str) -> CoreResult<TurnOutcome> {
        let Some(content) = normalize_input(text) else {
            return Err(ChatError::Validation("message is empty".into()));
        };
        self.append(ChatMessage::user(content)).await
    }

    /// Push `message` plus an assistant placeholder and stream the reply.
    ///
    /// Turn failures are reported through the sink and [`Self::error`] and
    /// come back as `Ok(TurnOutcome::Failed)`; `Err` means no turn ran.
    pub async fn append(&mut self, message: ChatMessage) -> CoreResult<TurnOutcome> {
        self.stop();
        let request = self.prepare_request(std::slice::from_ref(&message))?;
        self.messages.push(message);
        self.messages.push(ChatMessage::assistant_placeholder());
        self.run_turn(request).await
    }

    /// Drop everything after the most recent user message and ask again.
    pub async fn reload(&mut self) -> CoreResult<TurnOutcome> {
        self.stop();
        let Some(idx) = self.messages.iter().rposition(|m| m.role == Role::User) else {
            return Err(ChatError::Validation("no user message to resend".into()));
        };
        self.messages.truncate(idx + 1);
        let request = self.prepare_request(&[])?;
        self.messages.push(ChatMessage::assistant_placeholder());
        self.run_turn(request).await
    }

    /// Finish the running turn, keeping whatever content arrived.
    ///
    /// Safe to call at any time and any number of times.
    pub fn stop(&mut self) {
        self.scheduler.cancel();
        if !self.is_turn_open() {
            return;
        }
        self.transport.stop_chat();
        let finalized = self.release_in_flight();
        self.end_turn(finalized, TurnEnd::Stopped);
    }

    /// Body for the next request: history without placeholders, in order,
    /// then the conversation id, then configured and extra fields.
    pub fn build_request_body(&self) -> Value {
        self.body_for(&[])
    }

    fn body_for(&self, pending: &[ChatMessage]) -> Value {
        let messages: Vec<WireMessage> = self
            .messages
            .iter()
            .chain(pending)
            .filter(|m| !m.is_pending_placeholder())
            .map(WireMessage::from)
            .collect();

        let mut body = Map::new();
        body.insert("messages".into(), json!(messages));
        if let Some(id) = &self.conversation_id {
            body.insert("conversationId".into(), Value::String(id.clone()));
        }
        body.insert(
            "saveConversation".into(),
            Value::Bool(self.config.save_conversation),
        );
        for (k, v) in self.config.body.iter().chain(self.extra_body.iter()) {
            body.insert(k.clone(), v.clone());
        }
        Value::Object(body)
    }

    fn prepare_request(&self, pending: &[ChatMessage]) -> CoreResult<StartChatRequest> {
        let ep = &self.config.endpoint;
        let method = ep.http_method()?;
        let mut headers: Vec<(String, String)> = ep
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(token) = self.auth.bearer_token() {
            headers.push((
                "Authorization".into(),
                format!("Bearer {}", token.expose_secret()),
            ));
        }
        Ok(StartChatRequest {
            url: ep.url.clone(),
            method,
            headers,
            body: self.body_for(pending),
            timeout: Duration::from_millis(ep.timeout_ms),
            heartbeat_timeout: Duration::from_millis(ep.heartbeat_timeout_ms),
            max_retry_count: ep.max_retry_count,
        })
    }

    async fn run_turn(&mut self, request: StartChatRequest) -> CoreResult<TurnOutcome> {
        self.assembler.begin_turn();
        self.scheduler.cancel();
        self.error = None;
        self.last_outcome = None;
        self.stop_tx.send_replace(false);

        let span = tracing::info_span!(
            "chat.turn",
            transport = %self.transport.name(),
            conversation.id = Empty,
            turn.outcome = Empty,
            message.id = Empty,
            notify.count = Empty,
            content.len = Empty,
        );
        self.stats = TurnStats {
            span: Some(span.clone()),
            started: Some(Instant::now()),
            started_at_ms: now_ms(),
            ..TurnStats::default()
        };
        self.set_status(SessionStatus::Submitted);

        let this = &mut *self;
        async move {
            tracing::info!(history = this.messages.len(), "turn started");
            match this.transport.start_chat(request).await {
                Ok(events) => this.drive(events).await,
                Err(e) => {
                    let text = e.to_string();
                    this.fail_turn(text, e);
                }
            }
        }
        .instrument(span)
        .await;

        Ok(self.last_outcome.unwrap_or(TurnOutcome::Completed))
    }

    async fn drive(&mut self, mut events: TransportStream) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => {
                    self.stop();
                    break;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_due(Instant::now());
                }
                ev = events.next() => {
                    let Some(ev) = ev else {
                        self.on_finish();
                        break;
                    };
                    let from_stream = matches!(ev, TransportEvent::Message { .. });
                    if self.handle_event(ev, Instant::now()) == Flow::Done {
                        if from_stream {
                            // terminal frame arrived; drop whatever is left of the body
                            self.transport.stop_chat();
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch one transport event to its callback.
    pub fn handle_event(&mut self, ev: TransportEvent, now: Instant) -> Flow {
        match ev {
            TransportEvent::Open => {
                self.on_open();
                Flow::Continue
            }
            TransportEvent::Message { data, event } => {
                if let Some(name) = event {
                    tracing::trace!(event = %name, "named stream event");
                }
                self.on_message(&data, now)
            }
            TransportEvent::Error(text) => {
                self.on_error(&text);
                Flow::Done
            }
            TransportEvent::Finish => {
                self.on_finish();
                Flow::Done
            }
            TransportEvent::RetryLimitExceeded => {
                self.on_retry_limit_exceeded();
                Flow::Done
            }
        }
    }

    pub fn on_open(&mut self) {
        tracing::debug!("stream opened");
        if self.status == SessionStatus::Submitted {
            self.set_status(SessionStatus::Streaming);
        }
    }

    /// Run one delivery through the pipeline in arrival order.
    pub fn on_message(&mut self, data: &str, now: Instant) -> Flow {
        if self.status == SessionStatus::Submitted {
            self.set_status(SessionStatus::Streaming);
        }
        for parsed in parse_chunk(data) {
            self.stats.lines += 1;
            let frame = match parsed {
                ParsedLine::Terminal => Frame::Done,
                ParsedLine::Line(line) => match classify(&line) {
                    Some(frame) => frame,
                    None => continue,
                },
            };
            self.stats.frames += 1;
            if self.apply_frame(frame, now) == Flow::Done {
                return Flow::Done;
            }
        }
        Flow::Continue
    }

    pub fn on_error(&mut self, text: &str) {
        if !self.is_turn_open() {
            tracing::debug!(error = %text, "transport error outside a turn");
            return;
        }
        let err = if is_auth_failure(text) {
            self.auth.force_logout();
            ChatError::Unauthorized(text.to_string())
        } else {
            ChatError::Transport(text.to_string())
        };
        self.fail_turn(text.to_string(), err);
    }

    /// Stream ended without a terminal frame.
    pub fn on_finish(&mut self) {
        self.scheduler.cancel();
        if !self.is_turn_open() {
            return;
        }
        let finalized = self.release_in_flight();
        self.end_turn(finalized, TurnEnd::Completed);
    }

    pub fn on_retry_limit_exceeded(&mut self) {
        if !self.is_turn_open() {
            return;
        }
        let err = ChatError::RetryExhausted;
        self.fail_turn(err.to_string(), err);
    }

    /// Publish the pending debounced update if its window has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> bool {
        if !self.scheduler.poll_due(now) {
            return false;
        }
        self.notify_current();
        true
    }

    fn apply_frame(&mut self, frame: Frame, now: Instant) -> Flow {
        let terminal = frame.is_terminal();
        let protocol_error = match &frame {
            Frame::Error { message } => Some(message.clone()),
            _ => None,
        };
        match self.assembler.apply(frame, &self.messages) {
            Applied::ToolCallFailed { message } => {
                self.surface(ChatError::ToolCall(message));
                Flow::Continue
            }
            Applied::Finalized(msg) => {
                self.scheduler.route(UpdateKind::Terminal, now);
                let end = match protocol_error {
                    Some(message) => TurnEnd::Failed(ChatError::Protocol(message)),
                    None => TurnEnd::Completed,
                };
                self.end_turn(Some(msg), end);
                Flow::Done
            }
            // [DONE] with nothing left to finalize still ends the stream
            Applied::Unchanged if terminal => {
                self.on_finish();
                Flow::Done
            }
            applied => {
                if let Applied::MetadataMerged { key } = &applied {
                    self.adopt_conversation_id(key);
                }
                let notify_now = applied
                    .update_kind()
                    .is_some_and(|kind| self.scheduler.route(kind, now) == Dispatch::NotifyNow);
                if notify_now {
                    self.notify_current();
                }
                Flow::Continue
            }
        }
    }

    fn fail_turn(&mut self, message: String, err: ChatError) {
        self.scheduler.cancel();
        let finalized = self.assembler.finalize(
            Outcome::Failed {
                message,
                replace_content: false,
            },
            &self.messages,
        );
        self.end_turn(finalized, TurnEnd::Failed(err));
    }

    /// Complete the live message, or drop the untouched placeholder.
    fn release_in_flight(&mut self) -> Option<ChatMessage> {
        if self.assembler.current().is_some() {
            return self.assembler.finalize(Outcome::Completed, &self.messages);
        }
        self.assembler.seal();
        self.messages.retain(|m| !m.is_pending_placeholder());
        None
    }

    fn end_turn(&mut self, finalized: Option<ChatMessage>, end: TurnEnd) {
        if let Some(msg) = &finalized {
            match self.messages.iter_mut().find(|m| m.id == msg.id) {
                Some(slot) => *slot = msg.clone(),
                None => self.messages.push(msg.clone()),
            }
            self.notify(msg.clone());
        }

        let (outcome, status, err) = match end {
            TurnEnd::Completed => (TurnOutcome::Completed, SessionStatus::Ready, None),
            TurnEnd::Stopped => (TurnOutcome::Stopped, SessionStatus::Ready, None),
            TurnEnd::Failed(err) => (TurnOutcome::Failed, SessionStatus::Error, Some(err)),
        };
        if let Some(err) = &err {
            self.surface_ref(err);
        }
        self.last_outcome = Some(outcome);
        self.set_status(status);
        self.report_turn(finalized.as_ref(), outcome, err.as_ref());
    }

    fn report_turn(&mut self, msg: Option<&ChatMessage>, outcome: TurnOutcome, err: Option<&ChatError>) {
        let stats = std::mem::take(&mut self.stats);
        let content_len = msg.map(|m| m.content.chars().count()).unwrap_or(0);

        if let Some(span) = &stats.span {
            span.record("turn.outcome", outcome.as_str());
            span.record("notify.count", stats.notifications as u64);
            span.record("content.len", content_len as u64);
            if let Some(m) = msg {
                span.record("message.id", m.id.as_str());
            }
            if let Some(id) = &self.conversation_id {
                span.record("conversation.id", id.as_str());
            }
        }
        tracing::info!(
            outcome = outcome.as_str(),
            frames = stats.frames,
            notifications = stats.notifications,
            "turn finished"
        );

        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let mut log = TurnLog::new()
            .conversation_id_opt(self.conversation_id.as_deref())
            .message_id_opt(msg.map(|m| m.id.as_str()))
            .outcome(outcome)
            .started_at_ms(stats.started_at_ms)
            .content_len(content_len)
            .reasoning_ms_opt(msg.and_then(|m| m.reasoning_trace.as_ref()?.duration))
            .tool_calls(msg.map(|m| m.tool_calls.len()).unwrap_or(0))
            .counts(stats.lines, stats.frames, stats.notifications);
        if let Some(started) = stats.started {
            log = log.latency_ms(started.elapsed().as_millis() as u64);
        }
        if let Some(err) = err {
            log = log.error(err.kind(), &err.to_string());
        }
        telemetry.record_turn(log);
    }

    fn adopt_conversation_id(&mut self, key: &str) {
        if !CONVERSATION_ID_KEYS.contains(&key) {
            return;
        }
        let id = self
            .assembler
            .current()
            .and_then(|m| m.metadata.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
        let Some(id) = id else { return };
        if self.conversation_id.as_deref() != Some(id.as_str()) {
            tracing::debug!(conversation.id = %id, "adopted conversation id");
            self.conversation_id = Some(id);
        }
    }

    fn is_turn_open(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Submitted | SessionStatus::Streaming
        ) || self
            .assembler
            .current()
            .is_some_and(|m| m.status.is_in_flight())
    }

    fn notify_current(&mut self) {
        if let Some(msg) = self.assembler.snapshot() {
            self.notify(msg);
        }
    }

    fn notify(&mut self, msg: ChatMessage) {
        self.stats.notifications += 1;
        self.sink.message_updated(msg);
    }

    fn surface(&mut self, err: ChatError) {
        self.surface_ref(&err);
    }

    fn surface_ref(&mut self, err: &ChatError) {
        if err.is_terminal() {
            tracing::warn!(kind = err.kind(), error = %err, "chat turn failed");
        } else {
            tracing::info!(kind = err.kind(), error = %err, "chat error reported");
        }
        self.error = Some(err.to_string());
        self.sink.error(err);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            self.status = status;
            self.sink.status_changed(status);
        }
    }
}
