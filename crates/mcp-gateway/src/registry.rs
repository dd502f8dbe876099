//! Per-transport connection registry.
//!
//! Holds at most one connection per (backend, transport). Acquisition creates
//! on miss, replaces unhealthy records, and the maintenance tick reaps
//! connections that sat idle past their transport's threshold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendConfig, TransportKind, timeouts};
use crate::error::TransportResult;
use crate::transport::StatsSnapshot;
use crate::transport::http::HttpConnection;
use crate::transport::sse::SseConnection;
use crate::transport::stdio_tcp::StdioTcpConnection;

/// Registry of live backend connections, keyed by backend name per transport.
pub struct ConnectionRegistry {
    http: RwLock<HashMap<String, Arc<HttpConnection>>>,
    sse: RwLock<HashMap<String, Arc<SseConnection>>>,
    stdio: RwLock<HashMap<String, Arc<StdioTcpConnection>>>,
    http_client: reqwest::Client,
    cancel: CancellationToken,
}

/// Counts exposed on `/api/connections`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryCounts {
    pub http: usize,
    pub sse: usize,
    pub stdio: usize,
    #[serde(rename = "totalActiveManagedConnections")]
    pub total: usize,
}

/// Per-connection detail row for the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub backend: String,
    pub transport: &'static str,
    pub initialized: bool,
    pub healthy: bool,
    #[serde(rename = "idleSeconds")]
    pub idle_seconds: u64,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub stats: StatsSnapshot,
}

impl ConnectionRegistry {
    /// Build a registry with a shared pooled HTTP client.
    ///
    /// The client carries no global timeout: SSE streams are long-lived and
    /// must not be killed. Per-request deadlines come from the callers.
    pub fn new(cancel: CancellationToken) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeouts::CONNECT_TIMEOUT)
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http: RwLock::new(HashMap::new()),
            sse: RwLock::new(HashMap::new()),
            stdio: RwLock::new(HashMap::new()),
            http_client,
            cancel,
        })
    }

    /// The shared outbound HTTP client (also used for session DELETEs).
    #[must_use]
    pub fn http_client(&self) -> reqwest::Client {
        self.http_client.clone()
    }

    /// Acquire the HTTP connection for a backend, creating and initializing
    /// one when absent or unhealthy. Initialization runs outside the map lock.
    pub async fn http_connection(
        &self,
        backend: &BackendConfig,
    ) -> TransportResult<Arc<HttpConnection>> {
        if let Some(conn) = self.http.read().await.get(&backend.name) {
            if conn.is_healthy() {
                conn.touch().await;
                return Ok(Arc::clone(conn));
            }
        }

        let conn = Arc::new(HttpConnection::new(backend, self.http_client.clone()));
        conn.initialize(&self.cancel).await?;

        let mut map = self.http.write().await;
        if let Some(old) = map.insert(backend.name.clone(), Arc::clone(&conn)) {
            old.mark_unhealthy();
            tracing::debug!(backend = %backend.name, "replaced HTTP connection");
        }
        Ok(conn)
    }

    /// Acquire the SSE connection for a backend.
    pub async fn sse_connection(
        &self,
        backend: &BackendConfig,
    ) -> TransportResult<Arc<SseConnection>> {
        if let Some(conn) = self.sse.read().await.get(&backend.name) {
            if conn.is_healthy() {
                conn.touch().await;
                return Ok(Arc::clone(conn));
            }
        }

        let conn = SseConnection::open(backend, self.http_client.clone(), &self.cancel).await?;

        let mut map = self.sse.write().await;
        if let Some(old) = map.insert(backend.name.clone(), Arc::clone(&conn)) {
            old.close().await;
            tracing::debug!(backend = %backend.name, "replaced SSE connection");
        }
        Ok(conn)
    }

    /// Acquire the STDIO-TCP connection for a backend.
    pub async fn stdio_connection(
        &self,
        backend: &BackendConfig,
    ) -> TransportResult<Arc<StdioTcpConnection>> {
        if let Some(conn) = self.stdio.read().await.get(&backend.name) {
            if conn.is_healthy() {
                conn.touch().await;
                return Ok(Arc::clone(conn));
            }
        }

        let conn = Arc::new(StdioTcpConnection::open(backend).await?);

        let mut map = self.stdio.write().await;
        if let Some(old) = map.insert(backend.name.clone(), Arc::clone(&conn)) {
            old.mark_unhealthy();
            tracing::debug!(backend = %backend.name, "replaced stdio connection");
        }
        Ok(conn)
    }

    /// Peek at an existing HTTP connection without creating one.
    pub async fn peek_http(&self, backend: &str) -> Option<Arc<HttpConnection>> {
        self.http.read().await.get(backend).cloned()
    }

    /// Peek at an existing SSE connection without creating one.
    pub async fn peek_sse(&self, backend: &str) -> Option<Arc<SseConnection>> {
        self.sse.read().await.get(backend).cloned()
    }

    /// Peek at an existing STDIO-TCP connection without creating one.
    pub async fn peek_stdio(&self, backend: &str) -> Option<Arc<StdioTcpConnection>> {
        self.stdio.read().await.get(backend).cloned()
    }

    /// Drop one backend's connection for the given transport.
    pub async fn evict(&self, backend: &str, transport: TransportKind) {
        match transport {
            TransportKind::Http => {
                if let Some(conn) = self.http.write().await.remove(backend) {
                    conn.mark_unhealthy();
                }
            }
            TransportKind::Sse => {
                if let Some(conn) = self.sse.write().await.remove(backend) {
                    conn.close().await;
                }
            }
            TransportKind::StdioTcp => {
                if let Some(conn) = self.stdio.write().await.remove(backend) {
                    conn.mark_unhealthy();
                }
            }
            TransportKind::StdioExec => {}
        }
        tracing::info!(backend = %backend, transport = %transport, "evicted connection");
    }

    /// Reap connections idle past their transport's threshold. Returns how
    /// many were evicted.
    pub async fn reap_idle(&self) -> usize {
        let mut reaped = 0;

        {
            let mut map = self.http.write().await;
            let mut stale = Vec::new();
            for (name, conn) in map.iter() {
                if conn.idle_for().await > timeouts::IDLE_HTTP {
                    stale.push(name.clone());
                }
            }
            for name in stale {
                if let Some(conn) = map.remove(&name) {
                    conn.mark_unhealthy();
                    tracing::info!(backend = %name, "reaped idle HTTP connection");
                    reaped += 1;
                }
            }
        }

        {
            let mut map = self.sse.write().await;
            let mut stale = Vec::new();
            for (name, conn) in map.iter() {
                if conn.idle_for().await > timeouts::IDLE_SSE {
                    stale.push(name.clone());
                }
            }
            for name in stale {
                if let Some(conn) = map.remove(&name) {
                    conn.close().await;
                    tracing::info!(backend = %name, "reaped idle SSE connection");
                    reaped += 1;
                }
            }
        }

        {
            let mut map = self.stdio.write().await;
            let mut stale = Vec::new();
            for (name, conn) in map.iter() {
                if conn.idle_for().await > timeouts::IDLE_STDIO {
                    stale.push(name.clone());
                }
            }
            for name in stale {
                if let Some(conn) = map.remove(&name) {
                    conn.mark_unhealthy();
                    tracing::info!(backend = %name, "reaped idle stdio connection");
                    reaped += 1;
                }
            }
        }

        reaped
    }

    /// Ping every live HTTP connection; evict the ones that fail. Returns
    /// how many were evicted.
    pub async fn ping_http(&self) -> usize {
        let conns: Vec<(String, Arc<HttpConnection>)> = self
            .http
            .read()
            .await
            .iter()
            .map(|(name, conn)| (name.clone(), Arc::clone(conn)))
            .collect();

        let mut evicted = 0;
        for (name, conn) in conns {
            if !conn.ping().await {
                self.http.write().await.remove(&name);
                tracing::info!(backend = %name, "evicted HTTP connection after failed ping");
                evicted += 1;
            }
        }
        evicted
    }

    /// Drain everything. Every SSE connection is closed (unblocking its
    /// awaiters); HTTP and stdio records are dropped. Returns how many
    /// connections were closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;

        closed += self.http.write().await.drain().map(|(_, conn)| conn.mark_unhealthy()).count();

        let sse: Vec<_> = self.sse.write().await.drain().map(|(_, conn)| conn).collect();
        for conn in sse {
            conn.close().await;
            closed += 1;
        }

        closed += self.stdio.write().await.drain().map(|(_, conn)| conn.mark_unhealthy()).count();

        tracing::info!(closed, "drained connection registry");
        closed
    }

    /// Current per-transport connection counts.
    pub async fn counts(&self) -> RegistryCounts {
        let http = self.http.read().await.len();
        let sse = self.sse.read().await.len();
        let stdio = self.stdio.read().await.len();
        RegistryCounts { http, sse, stdio, total: http + sse + stdio }
    }

    /// Detail rows for every live connection.
    pub async fn connection_details(&self) -> Vec<ConnectionInfo> {
        let mut rows = Vec::new();

        for (name, conn) in self.http.read().await.iter() {
            rows.push(ConnectionInfo {
                backend: name.clone(),
                transport: TransportKind::Http.as_str(),
                initialized: conn.is_initialized(),
                healthy: conn.is_healthy(),
                idle_seconds: conn.idle_for().await.as_secs(),
                session_id: conn.sid().await,
                stats: conn.stats(),
            });
        }
        for (name, conn) in self.sse.read().await.iter() {
            rows.push(ConnectionInfo {
                backend: name.clone(),
                transport: TransportKind::Sse.as_str(),
                initialized: conn.is_initialized(),
                healthy: conn.is_healthy(),
                idle_seconds: conn.idle_for().await.as_secs(),
                session_id: conn.sid().await,
                stats: conn.stats(),
            });
        }
        for (name, conn) in self.stdio.read().await.iter() {
            rows.push(ConnectionInfo {
                backend: name.clone(),
                transport: TransportKind::StdioTcp.as_str(),
                initialized: conn.is_initialized(),
                healthy: conn.is_healthy(),
                idle_seconds: conn.idle_for().await.as_secs(),
                session_id: conn.sid().await,
                stats: conn.stats(),
            });
        }

        rows.sort_by(|a, b| a.backend.cmp(&b.backend));
        rows
    }

    /// Spawn the maintenance loop driving idle reaping.
    pub fn start_maintenance(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let cancel = registry.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(timeouts::REAP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let reaped = registry.reap_idle().await;
                        let evicted = registry.ping_http().await;
                        if reaped + evicted > 0 {
                            tracing::debug!(reaped, evicted, "maintenance tick completed");
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish()
    }
}
