//! SSE connector with a learned session endpoint.
//!
//! Two-phase protocol: a long-lived GET stream announces the session endpoint
//! in an `endpoint` event, then JSON-RPC requests are POSTed to that endpoint.
//! Replies either come back inline (200) or asynchronously on the stream
//! (202), correlated by stringified request id through a map of single-shot
//! channels.
//!
//! This is the enhanced variant: proxy-originated requests use string ids
//! from a monotonic counter, unsolicited notifications go to a bounded
//! channel with drop-on-full, and per-connection counters are kept.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{ConnectionStats, StatsSnapshot};
use crate::config::{BackendConfig, timeouts};
use crate::error::{TransportError, TransportResult};
use crate::rpc;

/// Capacity of the unsolicited-notification channel.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name; empty defaults to `message` per the SSE spec.
    pub event: String,
    /// Concatenated `data:` lines.
    pub data: String,
}

/// Incremental SSE frame parser over a byte stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: BytesMut,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain any complete frames.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = find_frame_end(&self.buf) {
            let block = self.buf.split_to(end.block_len);
            let block = &block[..end.content_len];
            if let Some(frame) = parse_block(block) {
                frames.push(frame);
            }
        }
        frames
    }
}

struct FrameEnd {
    content_len: usize,
    block_len: usize,
}

/// Locate the first blank-line frame boundary, tolerating `\r\n` endings.
fn find_frame_end(buf: &[u8]) -> Option<FrameEnd> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1] == b'\n' {
                return Some(FrameEnd { content_len: i, block_len: i + 2 });
            }
            if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                return Some(FrameEnd { content_len: i, block_len: i + 3 });
            }
        }
        i += 1;
    }
    None
}

/// Parse one frame block; comment-only and empty blocks yield nothing.
fn parse_block(block: &[u8]) -> Option<SseFrame> {
    let text = std::str::from_utf8(block).ok()?;
    let mut event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // id:, retry: and comment lines are irrelevant to this transport
    }

    if event.is_empty() && data_lines.is_empty() {
        return None;
    }
    let event = if event.is_empty() { "message".to_string() } else { event };
    Some(SseFrame { event, data: data_lines.join("\n") })
}

/// One live SSE session with a backend.
pub struct SseConnection {
    backend: String,
    origin: String,
    sse_url: String,
    client: reqwest::Client,
    endpoint: RwLock<Option<String>>,
    sid: RwLock<Option<String>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    stream_tx: Mutex<Option<mpsc::Sender<Value>>>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    healthy: AtomicBool,
    closed: AtomicBool,
    last_used: RwLock<Instant>,
    cancel: CancellationToken,
    server_capabilities: RwLock<Value>,
    server_info: RwLock<Value>,
    stats: ConnectionStats,
}

impl SseConnection {
    /// Open the stream, learn the session endpoint, start the reader, and
    /// run the (fire-and-forget) initialize sequence.
    pub async fn open(
        backend: &BackendConfig,
        client: reqwest::Client,
        parent: &CancellationToken,
    ) -> TransportResult<Arc<Self>> {
        let conn = Arc::new(Self {
            backend: backend.name.clone(),
            origin: backend.origin(),
            sse_url: backend.sse_url(),
            client,
            endpoint: RwLock::new(None),
            sid: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            stream_tx: Mutex::new(None),
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            last_used: RwLock::new(Instant::now()),
            cancel: parent.child_token(),
            server_capabilities: RwLock::new(Value::Null),
            server_info: RwLock::new(Value::Null),
            stats: ConnectionStats::default(),
        });

        let response = conn
            .client
            .get(&conn.sse_url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: "SSE stream open rejected".to_string(),
            });
        }

        let mut stream = response.bytes_stream().boxed();
        let mut parser = SseParser::new();

        // Phase A: block until the endpoint announcement or cancellation.
        let endpoint = conn.await_endpoint(&mut stream, &mut parser).await?;
        tracing::info!(backend = %conn.backend, endpoint = %endpoint, "learned SSE session endpoint");
        *conn.endpoint.write().await = Some(endpoint);

        // The stream stays open for the connection's lifetime; all further
        // frames are dispatched by the background reader.
        tokio::spawn(Arc::clone(&conn).read_loop(stream, parser));

        conn.initialize().await;
        Ok(conn)
    }

    async fn await_endpoint(
        &self,
        stream: &mut futures::stream::BoxStream<'_, Result<Bytes, reqwest::Error>>,
        parser: &mut SseParser,
    ) -> TransportResult<String> {
        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => return Err(TransportError::from_reqwest(err)),
                None => {
                    return Err(TransportError::Framing(
                        "SSE stream ended before endpoint event".to_string(),
                    ));
                }
            };
            for frame in parser.feed(&chunk) {
                if frame.event == "endpoint" {
                    return Ok(join_endpoint(&self.origin, frame.data.trim()));
                }
            }
        }
    }

    /// Fire-and-forget initialize. The session is declared initialized
    /// without awaiting the correlated reply, and capabilities are recorded
    /// as placeholders; servers that never answer still get notifications
    /// posted. Known correctness gap kept for backend compatibility.
    async fn initialize(&self) {
        let request = rpc::request(
            json!(self.next_request_id()),
            "initialize",
            json!({
                "protocolVersion": rpc::PROTOCOL_VERSION_SSE,
                "clientInfo": {
                    "name": "mcp-gateway",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {},
            }),
        );

        if let Err(err) = self.post(&request).await {
            tracing::warn!(backend = %self.backend, error = %err, "SSE initialize post failed");
        }
        if let Err(err) = self.post(&rpc::notification("notifications/initialized")).await {
            tracing::warn!(backend = %self.backend, error = %err, "initialized notification failed");
        }

        *self.server_capabilities.write().await = json!({"tools": {}});
        *self.server_info.write().await = json!({
            "name": self.backend,
            "version": "unknown",
        });
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(backend = %self.backend, "SSE backend session initialized");
    }

    async fn read_loop(
        self: Arc<Self>,
        mut stream: futures::stream::BoxStream<'static, Result<Bytes, reqwest::Error>>,
        mut parser: SseParser,
    ) {
        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for frame in parser.feed(&bytes) {
                        self.dispatch(frame).await;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(backend = %self.backend, error = %err, "SSE stream error");
                    break;
                }
                None => {
                    tracing::info!(backend = %self.backend, "SSE stream ended");
                    break;
                }
            }
        }
        // Reader exit always tears the connection down so every pending
        // awaiter observes a closed channel.
        self.close().await;
    }

    async fn dispatch(&self, frame: SseFrame) {
        match frame.event.as_str() {
            "endpoint" => {} // already learned during phase A
            "message" => {
                let value: Value = match serde_json::from_str(&frame.data) {
                    Ok(v) => v,
                    Err(err) => {
                        self.stats.record_failure();
                        tracing::warn!(backend = %self.backend, error = %err, "malformed SSE message frame");
                        return;
                    }
                };
                if let Some(id) = value.get("id") {
                    let key = rpc::id_key(id);
                    let sender = self.pending.lock().await.remove(&key);
                    match sender {
                        Some(tx) => {
                            if tx.send(value).is_err() {
                                tracing::debug!(backend = %self.backend, id = %key, "reply awaiter already gone");
                            }
                        }
                        None => {
                            tracing::warn!(backend = %self.backend, id = %key, "reply for unknown request id");
                        }
                    }
                } else {
                    self.fan_out_notification(value).await;
                }
            }
            other => {
                tracing::debug!(backend = %self.backend, event = %other, "ignoring SSE event");
            }
        }
    }

    async fn fan_out_notification(&self, value: Value) {
        let guard = self.stream_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(value).is_err() {
                tracing::warn!(backend = %self.backend, "stream channel full, dropping notification");
            }
        } else {
            tracing::warn!(backend = %self.backend, "unsolicited notification with no subscriber, dropped");
        }
    }

    /// Forward one JSON-RPC envelope.
    ///
    /// Requests with an id block until the inline (200) or correlated (202)
    /// reply, bounded by `budget`. Notifications return the compatibility
    /// acknowledgement body.
    pub async fn call(&self, request: &Value, budget: Duration) -> TransportResult<Value> {
        self.stats.record_request();
        self.touch().await;

        let Some(id) = request.get("id") else {
            self.post(request).await?;
            // JSON-RPC says notifications get no reply; kept for client compat.
            return Ok(json!({"jsonrpc": "2.0", "result": "accepted"}));
        };
        let key = rpc::id_key(id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        let status = match self.post_with_status(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.pending.lock().await.remove(&key);
                self.stats.record_failure();
                return Err(err);
            }
        };

        match status {
            PostOutcome::Inline(reply) => {
                self.pending.lock().await.remove(&key);
                Ok(reply)
            }
            PostOutcome::Accepted => {
                let reply = tokio::select! {
                    () = self.cancel.cancelled() => {
                        self.pending.lock().await.remove(&key);
                        return Err(TransportError::Cancelled);
                    }
                    reply = tokio::time::timeout(budget, rx) => reply,
                };
                match reply {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(_closed)) => Err(TransportError::ChannelClosed),
                    Err(_elapsed) => {
                        self.pending.lock().await.remove(&key);
                        self.stats.record_timeout();
                        Err(TransportError::Timeout(budget))
                    }
                }
            }
        }
    }

    /// Proxy-originated call with a generated string id (discovery, probes).
    pub async fn call_method(
        &self,
        method: &str,
        params: Value,
        budget: Duration,
    ) -> TransportResult<Value> {
        let request = rpc::request(json!(self.next_request_id()), method, params);
        self.call(&request, budget).await
    }

    async fn post(&self, body: &Value) -> TransportResult<()> {
        match self.post_with_status(body).await? {
            PostOutcome::Inline(_) | PostOutcome::Accepted => Ok(()),
        }
    }

    async fn post_with_status(&self, body: &Value) -> TransportResult<PostOutcome> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::Framing("no session endpoint learned".to_string()))?;

        let response = self
            .client
            .post(&endpoint)
            .timeout(timeouts::SSE_POST)
            .json(body)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(PostOutcome::Accepted);
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: "session endpoint rejected request".to_string(),
            });
        }
        let body = response.bytes().await.map_err(TransportError::from_reqwest)?;
        if body.is_empty() {
            return Ok(PostOutcome::Accepted);
        }
        Ok(PostOutcome::Inline(serde_json::from_slice(&body)?))
    }

    /// Tear the connection down. Idempotent: the first caller cancels the
    /// reader, drains the pending map (closing every reply channel), and
    /// flips the connection unhealthy.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let drained = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        self.healthy.store(false, Ordering::SeqCst);
        tracing::info!(backend = %self.backend, pending = drained, "closed SSE connection");
    }

    /// Bounded channel receiving unsolicited backend notifications. Replaces
    /// any previous subscriber.
    pub async fn subscribe_stream(&self) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        *self.stream_tx.lock().await = Some(tx);
        rx
    }

    fn next_request_id(&self) -> String {
        format!("gw-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adopt a client-supplied session id when none is held.
    pub async fn relay_sid(&self, client_sid: Option<&str>) {
        if let Some(client_sid) = client_sid {
            let mut sid = self.sid.write().await;
            if sid.is_none() {
                *sid = Some(client_sid.to_string());
            } else if sid.as_deref() != Some(client_sid) {
                tracing::warn!(
                    backend = %self.backend,
                    "client session id differs from proxy-held value, keeping proxy's"
                );
            }
        }
    }

    pub async fn sid(&self) -> Option<String> {
        self.sid.read().await.clone()
    }

    /// Drop session identity without tearing down the stream.
    pub async fn clear_session(&self) {
        *self.sid.write().await = None;
        self.initialized.store(false, Ordering::SeqCst);
    }

    pub async fn touch(&self) {
        *self.last_used.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_used.read().await.elapsed()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn session_endpoint(&self) -> Option<String> {
        self.endpoint.read().await.clone()
    }

    pub async fn server_info(&self) -> Value {
        self.server_info.read().await.clone()
    }

    pub async fn server_capabilities(&self) -> Value {
        self.server_capabilities.read().await.clone()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Number of outstanding awaiters (test and API visibility).
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl std::fmt::Debug for SseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnection")
            .field("backend", &self.backend)
            .field("sse_url", &self.sse_url)
            .field("initialized", &self.is_initialized())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

enum PostOutcome {
    Inline(Value),
    Accepted,
}

/// Join the origin with the server-announced endpoint path. Servers may
/// announce a bare path, a path with a query string, or a full URL.
fn join_endpoint(origin: &str, path: &str) -> String {
    if let Ok(absolute) = url::Url::parse(path) {
        return absolute.to_string();
    }
    match url::Url::parse(origin).and_then(|base| base.join(path)) {
        Ok(joined) => joined.to_string(),
        Err(_) => format!("{}/{}", origin.trim_end_matches('/'), path.trim_start_matches('/')),
    }
}
