use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures_util::stream::Stream;
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing_futures::Instrument;

use crate::config::EndpointCfg;
use crate::error::{ChatError, CoreResult};
use crate::transport::{ChatTransport, StartChatRequest, TransportEvent, TransportStream};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// SSE-over-HTTP transport built on reqwest.
///
/// Each `start_chat` spawns one task that connects (with bounded retry),
/// splits the body into lines and forwards them as `TransportEvent`s.
/// `stop_chat` aborts that task.
#[derive(Debug)]
pub struct HttpSseTransport {
    inner: Client,
    user_agent: String,
    retry_backoff: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpSseTransport {
    pub fn new_default() -> CoreResult<Self> {
        Self::build(Duration::from_secs(5), Duration::from_millis(500))
    }

    pub fn from_config(cfg: &EndpointCfg) -> CoreResult<Self> {
        Self::build(
            Duration::from_millis(cfg.connect_timeout_ms),
            Duration::from_millis(cfg.retry_backoff_ms),
        )
    }

    fn build(connect_timeout: Duration, retry_backoff: Duration) -> CoreResult<Self> {
        let inner = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| ChatError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "chatstream/0.1".to_string(),
            retry_backoff,
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ChatTransport for HttpSseTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn start_chat(&self, req: StartChatRequest) -> CoreResult<TransportStream> {
        // one live stream per transport
        self.stop_chat();

        let (tx, rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("sse.stream", url = %req.url, method = %req.method);
        let worker = StreamWorker {
            client: self.inner.clone(),
            user_agent: self.user_agent.clone(),
            retry_backoff: self.retry_backoff,
            req,
            tx,
        };
        let handle = tokio::spawn(worker.run().instrument(span));
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(handle);
        }

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ev| (ev, rx))
        })
        .boxed())
    }

    fn stop_chat(&self) {
        let handle = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

enum AttemptError {
    Retryable(String),
    Fatal(String),
}

struct StreamWorker {
    client: Client,
    user_agent: String,
    retry_backoff: Duration,
    req: StartChatRequest,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl StreamWorker {
    async fn run(self) {
        let Some(resp) = self.connect().await else {
            return;
        };
        if self.tx.send(TransportEvent::Open).is_err() {
            return;
        }
        tracing::debug!("stream open");

        let mut lines =
            LineStream::with_heartbeat(Box::pin(resp.bytes_stream()), self.req.heartbeat_timeout);
        let mut event_name: Option<String> = None;
        loop {
            let ev = match lines.next().await {
                None => TransportEvent::Finish,
                Some(Err(ChatError::Transport(msg))) => TransportEvent::Error(msg),
                Some(Err(e)) => TransportEvent::Error(e.to_string()),
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        // blank line closes the SSE event
                        event_name = None;
                        continue;
                    }
                    if let Some(name) = line.strip_prefix("event:") {
                        event_name = Some(name.trim().to_string());
                        continue;
                    }
                    if line.starts_with(':') {
                        continue;
                    }
                    TransportEvent::Message {
                        data: line,
                        event: event_name.clone(),
                    }
                }
            };
            let last = !matches!(ev, TransportEvent::Message { .. });
            if self.tx.send(ev).is_err() || last {
                return;
            }
        }
    }

    /// Connect, retrying connection failures, 429 and 5xx with exponential
    /// backoff. Reports the terminal event itself and returns `None` on failure.
    async fn connect(&self) -> Option<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            match self.send().await {
                Ok(resp) => return Some(resp),
                Err(AttemptError::Fatal(msg)) => {
                    tracing::warn!(error = %msg, "stream request rejected");
                    let _ = self.tx.send(TransportEvent::Error(msg));
                    return None;
                }
                Err(AttemptError::Retryable(msg)) => {
                    if attempt >= self.req.max_retry_count {
                        tracing::warn!(attempts = attempt + 1, error = %msg, "giving up on stream request");
                        let ev = if self.req.max_retry_count == 0 {
                            TransportEvent::Error(msg)
                        } else {
                            TransportEvent::RetryLimitExceeded
                        };
                        let _ = self.tx.send(ev);
                        return None;
                    }
                    let delay = backoff_delay(self.retry_backoff, attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %msg, "retrying stream request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send(&self) -> Result<reqwest::Response, AttemptError> {
        let mut rb = self
            .client
            .request(self.req.method.clone(), &self.req.url)
            .json(&self.req.body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");
        for (k, v) in &self.req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }

        // the timeout covers getting response headers, not the stream itself
        let resp = match tokio::time::timeout(self.req.timeout, rb.send()).await {
            Err(_) => {
                return Err(AttemptError::Retryable(format!(
                    "request timed out after {}ms",
                    self.req.timeout.as_millis()
                )));
            }
            Ok(Err(e)) => return Err(AttemptError::Retryable(format!("connect failed: {e}"))),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let msg = format!("HTTP {status}: {}", truncate(&body, 300));
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(AttemptError::Retryable(msg))
        } else {
            Err(AttemptError::Fatal(msg))
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(MAX_BACKOFF)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Splits a byte stream on `\n` (dropping a trailing `\r`). Bytes are
/// buffered until a full line is present, so multi-byte characters split
/// across network chunks decode correctly.
///
/// With a heartbeat, any received bytes reset the idle timer; a gap longer
/// than the limit ends the stream with an error, newline or not.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    done: bool,
    idle: Option<(Duration, Pin<Box<Sleep>>)>,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            done: false,
            idle: None,
        }
    }

    fn with_heartbeat(inner: ByteStream, limit: Duration) -> Self {
        Self {
            idle: Some((limit, Box::pin(tokio::time::sleep(limit)))),
            ..Self::new(inner)
        }
    }

    fn touch(&mut self) {
        if let Some((limit, timer)) = self.idle.as_mut() {
            let deadline = Instant::now() + *limit;
            timer.as_mut().reset(deadline);
        }
    }

    /// The idle limit, once it has elapsed.
    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Option<Duration> {
        let (limit, timer) = self.idle.as_mut()?;
        timer.as_mut().poll(cx).is_ready().then_some(*limit)
    }

    fn take_line(&mut self, end: usize) -> String {
        let mut line: Vec<u8> = self.buf.drain(..end).collect();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

impl Stream for LineStream {
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                return Poll::Ready(Some(Ok(self.take_line(idx + 1))));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                    self.touch();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ChatError::Transport(format!(
                        "stream read failed: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if !self.buf.is_empty() {
                        let len = self.buf.len();
                        return Poll::Ready(Some(Ok(self.take_line(len))));
                    }
                }
                Poll::Pending => {
                    if let Some(limit) = self.poll_idle(cx) {
                        self.done = true;
                        return Poll::Ready(Some(Err(ChatError::Transport(format!(
                            "heartbeat timeout: no data for {}ms",
                            limit.as_millis()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
