//! Streamable-HTTP connector (MCP spec 2025-03-26).
//!
//! Each request is an independent POST against the backend's base URL over a
//! pooled client. The backend may answer with plain JSON or with a one-frame
//! `text/event-stream` body; both carry exactly one JSON-RPC reply. Session
//! identity travels in the `Mcp-Session-Id` header in both directions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{ConnectionStats, SESSION_HEADER, StatsSnapshot};
use crate::config::{BackendConfig, retry, timeouts};
use crate::error::{TransportError, TransportResult};
use crate::rpc;

/// One live streamable-HTTP session with a backend.
pub struct HttpConnection {
    backend: String,
    base_url: String,
    client: reqwest::Client,
    sid: RwLock<Option<String>>,
    initialized: AtomicBool,
    healthy: AtomicBool,
    last_used: RwLock<Instant>,
    server_capabilities: RwLock<Value>,
    server_info: RwLock<Value>,
    next_ping_id: AtomicU64,
    stats: ConnectionStats,
}

impl HttpConnection {
    #[must_use]
    pub fn new(backend: &BackendConfig, client: reqwest::Client) -> Self {
        Self {
            backend: backend.name.clone(),
            base_url: backend.base_url(),
            client,
            sid: RwLock::new(None),
            initialized: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            last_used: RwLock::new(Instant::now()),
            server_capabilities: RwLock::new(Value::Null),
            server_info: RwLock::new(Value::Null),
            next_ping_id: AtomicU64::new(1),
            stats: ConnectionStats::default(),
        }
    }

    /// Back-off before retrying a failed initialization attempt.
    ///
    /// Connect-class failures wait `(3n+2)s`, timeouts `(2n+1)s`, anything
    /// else `n s`, where `n` is the 1-based attempt number.
    #[must_use]
    pub fn init_backoff(attempt: u32, err: &TransportError) -> Duration {
        let n = u64::from(attempt);
        if err.is_connect_class() {
            Duration::from_secs(3 * n + 2)
        } else if err.is_timeout_class() {
            Duration::from_secs(2 * n + 1)
        } else {
            Duration::from_secs(n)
        }
    }

    /// Run the initialize sequence, retrying up to three times.
    pub async fn initialize(&self, cancel: &CancellationToken) -> TransportResult<()> {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            match self.initialize_once().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < retry::INIT_ATTEMPTS && err.is_retryable() => {
                    let wait = Self::init_backoff(attempt, &err);
                    tracing::warn!(
                        backend = %self.backend,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "initialize failed, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(TransportError::Cancelled),
                        () = tokio::time::sleep(wait) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.healthy.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    async fn initialize_once(&self) -> TransportResult<()> {
        let request = rpc::request(
            json!("init-1"),
            "initialize",
            json!({
                "protocolVersion": rpc::PROTOCOL_VERSION_HTTP,
                "clientInfo": {
                    "name": "mcp-gateway",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {},
            }),
        );

        let reply = self.post(&request, timeouts::HTTP_INITIALIZE).await?;

        if let Some(error) = reply.get("error") {
            return Err(TransportError::Framing(format!(
                "backend rejected initialize: {error}"
            )));
        }
        if let Some(result) = reply.get("result") {
            *self.server_capabilities.write().await =
                result.get("capabilities").cloned().unwrap_or(Value::Null);
            *self.server_info.write().await =
                result.get("serverInfo").cloned().unwrap_or(Value::Null);
        }

        // The initialized notification is best-effort.
        if let Err(err) = self.notify(&rpc::notification("notifications/initialized")).await {
            tracing::warn!(backend = %self.backend, error = %err, "initialized notification failed");
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(backend = %self.backend, "HTTP backend session initialized");
        Ok(())
    }

    /// Forward one JSON-RPC request and return the backend's reply.
    pub async fn call(&self, request: &Value, budget: Duration) -> TransportResult<Value> {
        self.stats.record_request();
        self.touch().await;
        match self.post(request, budget).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if err.is_timeout_class() {
                    self.stats.record_timeout();
                } else {
                    self.stats.record_failure();
                }
                self.healthy.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Send a notification; any 2xx means accepted.
    pub async fn notify(&self, notification: &Value) -> TransportResult<()> {
        let mut builder = self.request_builder().timeout(timeouts::HTTP_PING).json(notification);
        if let Some(sid) = self.sid.read().await.clone() {
            builder = builder.header(SESSION_HEADER, sid);
        }
        let response = builder.send().await.map_err(TransportError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                message: "notification rejected".to_string(),
            })
        }
    }

    /// Synchronous health probe. A failed ping flips the connection unhealthy
    /// so the registry evicts it on next acquisition.
    pub async fn ping(&self) -> bool {
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let request = rpc::request(json!(format!("ping-{id}")), "ping", Value::Null);
        match self.post(&request, timeouts::HTTP_PING).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(backend = %self.backend, error = %err, "ping failed");
                self.healthy.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Forward a client-initiated session DELETE. The proxy's own session
    /// state is cleared regardless of what the backend answers.
    pub async fn terminate_session(&self, sid: &str) -> TransportResult<(u16, bytes::Bytes)> {
        let result = self
            .client
            .delete(&self.base_url)
            .header(SESSION_HEADER, sid)
            .timeout(timeouts::HTTP_PING)
            .send()
            .await;

        self.clear_session().await;

        let response = result.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(TransportError::from_reqwest)?;
        Ok((status, body))
    }

    async fn post(&self, request: &Value, budget: Duration) -> TransportResult<Value> {
        let mut builder = self.request_builder().timeout(budget).json(request);
        if let Some(sid) = self.sid.read().await.clone() {
            builder = builder.header(SESSION_HEADER, sid);
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;

        // Capture the session id before consuming the body; backends may
        // assign one on initialize or rotate it mid-session.
        let header_sid = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(new_sid) = header_sid {
            let mut sid = self.sid.write().await;
            let rotated = sid.as_deref().is_some_and(|old| old != new_sid);
            if rotated {
                tracing::info!(backend = %self.backend, "backend rotated session id");
            }
            if rotated || sid.is_none() {
                *sid = Some(new_sid);
            }
        }

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status: status.as_u16(), message });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.bytes().await.map_err(TransportError::from_reqwest)?;

        parse_rpc_body(&content_type, &body)
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        self.client.post(&self.base_url).headers(headers)
    }

    /// Adopt a client-supplied session id when the proxy holds none. When the
    /// proxy already holds one, its value is authoritative.
    pub async fn relay_sid(&self, client_sid: Option<&str>) {
        if let Some(client_sid) = client_sid {
            let mut sid = self.sid.write().await;
            if sid.is_none() {
                *sid = Some(client_sid.to_string());
                tracing::debug!(backend = %self.backend, "adopted client session id");
            } else if sid.as_deref() != Some(client_sid) {
                tracing::warn!(
                    backend = %self.backend,
                    "client session id differs from proxy-held value, keeping proxy's"
                );
            }
        }
    }

    /// Current session id, if any.
    pub async fn sid(&self) -> Option<String> {
        self.sid.read().await.clone()
    }

    /// Drop the session id and uninitialize without tearing down the transport.
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

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
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
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("backend", &self.backend)
            .field("base_url", &self.base_url)
            .field("initialized", &self.is_initialized())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Decode a backend reply body, handling both content types streamable HTTP
/// allows.
///
/// A `text/event-stream` body carries exactly one `data:` frame with the
/// JSON-RPC reply; everything else is parsed as plain JSON.
pub fn parse_rpc_body(content_type: &str, body: &[u8]) -> TransportResult<Value> {
    if content_type.starts_with("text/event-stream") {
        let text = std::str::from_utf8(body)
            .map_err(|e| TransportError::Framing(format!("non-UTF-8 event stream: {e}")))?;
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                return Ok(serde_json::from_str(data.trim())?);
            }
        }
        Err(TransportError::Framing("event-stream response carried no data frame".to_string()))
    } else {
        Ok(serde_json::from_slice(body)?)
    }
}
