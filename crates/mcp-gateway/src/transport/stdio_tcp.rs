//! Line-delimited JSON-RPC over a long-lived TCP socket ("socat-stdio").
//!
//! One JSON-RPC object per newline-terminated UTF-8 line in each direction.
//! The transport is strictly FIFO: a single mutex covers the whole
//! write-then-read cycle, so at most one request is in flight per connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};

use super::{ConnectionStats, StatsSnapshot};
use crate::config::{BackendConfig, retry, timeouts};
use crate::error::{TransportError, TransportResult};
use crate::rpc;

/// Buffer size for the framed reader and writer.
const IO_BUFFER: usize = 8 * 1024;

struct StdioIo {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

/// One live STDIO-TCP session with a backend.
pub struct StdioTcpConnection {
    backend: String,
    addr: String,
    io: Mutex<StdioIo>,
    sid: RwLock<Option<String>>,
    initialized: AtomicBool,
    healthy: AtomicBool,
    last_used: RwLock<Instant>,
    next_id: AtomicU64,
    server_capabilities: RwLock<Value>,
    server_info: RwLock<Value>,
    stats: ConnectionStats,
}

impl StdioTcpConnection {
    /// Acquire a connection: up to three attempts with linear back-off, then
    /// the initialize handshake.
    pub async fn open(backend: &BackendConfig) -> TransportResult<Self> {
        let addr = backend.stdio_addr();
        let mut attempt = 1;
        let stream = loop {
            match connect_once(&addr).await {
                Ok(stream) => break stream,
                Err(err) if attempt < retry::STDIO_ATTEMPTS && err.is_retryable() => {
                    let wait = Duration::from_secs(u64::from(attempt));
                    tracing::warn!(
                        backend = %backend.name,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "stdio connect failed, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let conn = Self::from_stream(backend, stream);
        conn.initialize().await?;
        Ok(conn)
    }

    fn from_stream(backend: &BackendConfig, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            backend: backend.name.clone(),
            addr: backend.stdio_addr(),
            io: Mutex::new(StdioIo {
                reader: BufReader::with_capacity(IO_BUFFER, read_half),
                writer: BufWriter::with_capacity(IO_BUFFER, write_half),
            }),
            sid: RwLock::new(None),
            initialized: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            last_used: RwLock::new(Instant::now()),
            next_id: AtomicU64::new(1),
            server_capabilities: RwLock::new(Value::Null),
            server_info: RwLock::new(Value::Null),
            stats: ConnectionStats::default(),
        }
    }

    async fn initialize(&self) -> TransportResult<()> {
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

        let mut io = self.io.lock().await;
        write_line(&mut io.writer, &request, timeouts::STDIO_INIT_IO).await?;
        let reply =
            read_reply(&mut io.reader, timeouts::STDIO_INIT_IO, &self.backend, &self.stats)
                .await?;

        if let Some(result) = reply.get("result") {
            *self.server_capabilities.write().await =
                result.get("capabilities").cloned().unwrap_or(Value::Null);
            *self.server_info.write().await =
                result.get("serverInfo").cloned().unwrap_or(Value::Null);
        }

        // Best-effort; some hosters never ack the notification.
        let initialized = rpc::notification("notifications/initialized");
        if let Err(err) = write_line(&mut io.writer, &initialized, timeouts::STDIO_INIT_IO).await {
            tracing::warn!(backend = %self.backend, error = %err, "initialized notification failed");
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(backend = %self.backend, addr = %self.addr, "stdio backend session initialized");
        Ok(())
    }

    /// Forward one JSON-RPC envelope. Returns `None` for notifications.
    ///
    /// The mutex is held across the whole write-then-read cycle; requests on
    /// the same connection never interleave.
    pub async fn call(&self, request: &Value) -> TransportResult<Option<Value>> {
        self.stats.record_request();
        self.touch().await;

        let is_notification = request.get("id").is_none();
        let mut io = self.io.lock().await;

        let outcome: TransportResult<Option<Value>> = async {
            write_line(&mut io.writer, request, timeouts::STDIO_IO).await?;
            if is_notification {
                return Ok(None);
            }
            let reply =
                read_reply(&mut io.reader, timeouts::STDIO_IO, &self.backend, &self.stats).await?;
            Ok(Some(reply))
        }
        .await;

        if let Err(err) = &outcome {
            if err.is_timeout_class() {
                self.stats.record_timeout();
            } else {
                self.stats.record_failure();
            }
            self.healthy.store(false, Ordering::SeqCst);
        }
        outcome
    }

    /// Proxy-originated call with a generated string id.
    pub async fn call_method(&self, method: &str, params: Value) -> TransportResult<Value> {
        let request = rpc::request(json!(self.next_request_id()), method, params);
        self.call(&request).await?.ok_or(TransportError::ChannelClosed)
    }

    /// Open a fresh ephemeral connection, run one request, and drop it.
    ///
    /// Used only by tool discovery so startup probing never pollutes the
    /// long-lived pool. Acquisition retry is the caller's business.
    pub async fn discover_tools(backend: &BackendConfig) -> TransportResult<Value> {
        let stream = connect_once(&backend.stdio_addr()).await?;
        let conn = Self::from_stream(backend, stream);
        conn.initialize().await?;
        let reply = conn.call_method("tools/list", Value::Null).await?;

        // Half-close politely; the socket is gone either way when conn drops.
        let mut io = conn.io.lock().await;
        let _ = io.writer.shutdown().await;
        Ok(reply)
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

    /// Drop session identity without closing the socket.
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

impl std::fmt::Debug for StdioTcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTcpConnection")
            .field("backend", &self.backend)
            .field("addr", &self.addr)
            .field("initialized", &self.is_initialized())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

async fn connect_once(addr: &str) -> TransportResult<TcpStream> {
    let stream = tokio::time::timeout(timeouts::STDIO_CONNECT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(timeouts::STDIO_CONNECT))?
        .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;

    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(timeouts::STDIO_KEEPALIVE)
        .with_interval(timeouts::STDIO_KEEPALIVE);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    Ok(stream)
}

async fn write_line(
    writer: &mut BufWriter<OwnedWriteHalf>,
    value: &Value,
    deadline: Duration,
) -> TransportResult<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    tokio::time::timeout(deadline, async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| TransportError::Timeout(deadline))??;
    Ok(())
}

/// Read lines until one parses as a JSON-RPC reply. Echoes of outgoing
/// requests and non-JSON noise are skipped; the deadline bounds the whole
/// scan, not each line.
async fn read_reply(
    reader: &mut BufReader<OwnedReadHalf>,
    deadline: Duration,
    backend: &str,
    stats: &ConnectionStats,
) -> TransportResult<Value> {
    tokio::time::timeout(deadline, async {
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "backend closed the stream",
                )));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) if rpc::is_reply(&value) => return Ok(value),
                Ok(_) => {
                    tracing::debug!(backend = %backend, "skipping non-reply line");
                }
                Err(err) => {
                    stats.record_failure();
                    tracing::warn!(backend = %backend, error = %err, "skipping malformed line");
                }
            }
        }
    })
    .await
    .map_err(|_| TransportError::Timeout(deadline))?
}
