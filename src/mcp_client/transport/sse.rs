//! HTTP event-stream transport.
//!
//! Opens a long-lived `text/event-stream` GET to the server. The first
//! `endpoint` event names the URL that client frames are POSTed to; every
//! `message` event carries one server frame.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::{StateCell, Transport, TransportState};
use crate::mcp_client::errors::McpError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long `start()` waits for the server to announce its POST endpoint.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered server frames before the stream reader applies backpressure.
const EVENT_BUFFER: usize = 64;

// ─── Parameters ──────────────────────────────────────────────────────────────

/// How to reach an HTTP event-stream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseServerParameters {
    /// Event-stream URL, e.g. `http://localhost:8000/sse`.
    pub url: String,
    /// Headers sent on the stream request and on every POST.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl SseServerParameters {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

// ─── SSE Decoding ────────────────────────────────────────────────────────────

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` decoder.
///
/// Accepts arbitrary byte chunks (events and UTF-8 sequences may straddle
/// chunk boundaries) and yields complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    text: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);

        let decodable = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            // Truncated multi-byte sequence: keep the tail for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let decoded = String::from_utf8_lossy(&self.pending[..decodable]).into_owned();
        self.pending.drain(..decodable);

        self.text.push_str(&decoded);
        if self.text.contains('\r') {
            self.text = self.text.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.text.find("\n\n") {
            let block: String = self.text.drain(..end + 2).collect();
            if let Some(event) = parse_event(&block[..end]) {
                events.push(event);
            }
        }
        events
    }
}

/// Parse one event block (lines between blank lines).
fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut id = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
        id,
    })
}

// ─── Transport ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Connection {
    client: reqwest::Client,
    base: Url,
}

/// MCP transport over an HTTP event stream plus POSTed client frames.
#[derive(Debug)]
pub struct SseTransport {
    params: SseServerParameters,
    state: StateCell,
    connection: StdMutex<Option<Connection>>,
    post_url: StdMutex<Option<Url>>,
    events: Mutex<Option<mpsc::Receiver<Result<String, McpError>>>>,
    stream_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(params: SseServerParameters) -> Self {
        Self {
            params,
            state: StateCell::new(),
            connection: StdMutex::new(None),
            post_url: StdMutex::new(None),
            events: Mutex::new(None),
            stream_task: StdMutex::new(None),
        }
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            endpoint: self.params.url.clone(),
            reason,
        }
    }

    fn connect_failed(&self, reason: String) -> McpError {
        McpError::SpawnFailed {
            command: self.params.url.clone(),
            reason,
        }
    }

    fn connection(&self) -> Option<Connection> {
        self.connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::InvalidParameters {
            reason: format!("invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::InvalidParameters {
            reason: format!("invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Read the event stream, announcing the POST endpoint once and forwarding
/// message payloads.
async fn pump_event_stream(
    response: reqwest::Response,
    base: Url,
    endpoint_tx: oneshot::Sender<Result<Url, String>>,
    events_tx: mpsc::Sender<Result<String, McpError>>,
) {
    let endpoint_label = base.to_string();
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::new();
    let mut bytes = response.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = events_tx
                    .send(Err(McpError::TransportError {
                        endpoint: endpoint_label.clone(),
                        reason: format!("stream read error: {e}"),
                    }))
                    .await;
                return;
            }
        };

        for event in decoder.push(&chunk) {
            match event.event.as_deref() {
                Some("endpoint") => {
                    let resolved = base
                        .join(event.data.trim())
                        .map_err(|e| format!("bad endpoint '{}': {e}", event.data));
                    match endpoint_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(resolved);
                        }
                        None => tracing::debug!(url = %endpoint_label, "ignoring repeated endpoint event"),
                    }
                }
                None | Some("message") => {
                    if events_tx.send(Ok(event.data)).await.is_err() {
                        return;
                    }
                }
                Some(other) => {
                    tracing::trace!(url = %endpoint_label, event = other, "ignoring event");
                }
            }
        }
    }

    tracing::debug!(url = %endpoint_label, "event stream ended");
}

#[async_trait]
impl Transport for SseTransport {
    fn endpoint(&self) -> String {
        self.params.url.clone()
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn init(&self) -> Result<(), McpError> {
        self.state.require(TransportState::Constructed)?;

        let base = Url::parse(&self.params.url).map_err(|e| McpError::InvalidParameters {
            reason: format!("invalid url '{}': {e}", self.params.url),
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(McpError::InvalidParameters {
                reason: format!("unsupported url scheme '{}'", base.scheme()),
            });
        }

        let client = reqwest::Client::builder()
            .default_headers(build_headers(&self.params.headers)?)
            .build()
            .map_err(|e| McpError::InvalidParameters {
                reason: format!("failed to build http client: {e}"),
            })?;

        *self
            .connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Connection { client, base });

        self.state
            .transition(TransportState::Constructed, TransportState::Initialized)
    }

    async fn start(&self) -> Result<(), McpError> {
        self.state.require(TransportState::Initialized)?;
        let Connection { client, base } = self
            .connection()
            .ok_or_else(|| McpError::invalid_state(TransportState::Initialized, self.state.get()))?;

        let response = client
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| self.connect_failed(format!("{e}")))?;

        if !response.status().is_success() {
            return Err(self.connect_failed(format!("HTTP {}", response.status())));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(pump_event_stream(response, base.clone(), endpoint_tx, events_tx));

        let post_url = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(Ok(url))) => url,
            Ok(Ok(Err(reason))) => {
                task.abort();
                return Err(self.connect_failed(reason));
            }
            Ok(Err(_)) => {
                task.abort();
                return Err(self.connect_failed("stream ended before endpoint event".into()));
            }
            Err(_) => {
                task.abort();
                return Err(self.connect_failed(format!(
                    "no endpoint event within {}s",
                    ENDPOINT_TIMEOUT.as_secs()
                )));
            }
        };

        if post_url.origin() != base.origin() {
            task.abort();
            return Err(self.connect_failed(format!(
                "endpoint {post_url} is not on the stream's origin"
            )));
        }

        tracing::info!(url = %base, post_url = %post_url, "event stream connected");

        *self
            .post_url
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(post_url);
        *self.events.lock().await = Some(events_rx);
        *self
            .stream_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);

        self.state
            .transition(TransportState::Initialized, TransportState::Started)
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        self.state.require(TransportState::Started)?;

        let post_url = self
            .post_url
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.transport_error("no endpoint announced".into()))?;
        let Connection { client, .. } = self
            .connection()
            .ok_or_else(|| self.transport_error("not connected".into()))?;

        tracing::trace!(url = %post_url, frame = message, "posting frame");

        let response = client
            .post(post_url)
            .header(CONTENT_TYPE, "application/json")
            .body(message.trim_end().to_string())
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }

    async fn receive(&self) -> Result<String, McpError> {
        self.state.require(TransportState::Started)?;

        let mut guard = self.events.lock().await;
        let events = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("event stream not open".into()))?;

        match events.recv().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(e),
            None => Err(self.transport_error("event stream closed".into())),
        }
    }

    async fn stop(&self) -> Result<(), McpError> {
        if !self.state.stop() {
            return Ok(());
        }
        if let Some(task) = self
            .stream_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        tracing::info!(url = %self.params.url, "event stream closed");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
