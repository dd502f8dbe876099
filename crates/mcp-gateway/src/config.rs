//! Gateway configuration: backend descriptors and operation budgets.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Timeout and interval budgets, one place for every deadline the gateway enforces.
pub mod timeouts {
    use std::time::Duration;

    /// HTTP `initialize` request budget.
    pub const HTTP_INITIALIZE: Duration = Duration::from_secs(90);

    /// HTTP normal call budget.
    pub const HTTP_CALL: Duration = Duration::from_secs(120);

    /// HTTP `ping` health-check budget.
    pub const HTTP_PING: Duration = Duration::from_secs(30);

    /// SSE awaited-reply budget for normal calls.
    pub const SSE_REPLY: Duration = Duration::from_secs(60);

    /// Budget for a single POST to an SSE session endpoint.
    pub const SSE_POST: Duration = Duration::from_secs(30);

    /// STDIO-TCP connect budget.
    pub const STDIO_CONNECT: Duration = Duration::from_secs(15);

    /// STDIO-TCP read/write budget during the initialize handshake.
    pub const STDIO_INIT_IO: Duration = Duration::from_secs(30);

    /// STDIO-TCP read/write budget for normal calls.
    pub const STDIO_IO: Duration = Duration::from_secs(60);

    /// TCP keep-alive probe period for STDIO-TCP sockets.
    pub const STDIO_KEEPALIVE: Duration = Duration::from_secs(15);

    /// Total budget for one exec-stdio call (spawn to exit).
    pub const EXEC_TOTAL: Duration = Duration::from_secs(30);

    /// Maintenance tick driving idle reaping.
    pub const REAP_INTERVAL: Duration = Duration::from_secs(300);

    /// Idle threshold for HTTP connections.
    pub const IDLE_HTTP: Duration = Duration::from_secs(600);

    /// Idle threshold for SSE connections.
    pub const IDLE_SSE: Duration = Duration::from_secs(900);

    /// Idle threshold for STDIO-TCP connections.
    pub const IDLE_STDIO: Duration = Duration::from_secs(900);

    /// Tool cache time-to-live (one shared window for all entries).
    pub const TOOL_CACHE_TTL: Duration = Duration::from_secs(300);

    /// Assembled OpenAPI document cache time-to-live.
    pub const OPENAPI_CACHE_TTL: Duration = Duration::from_secs(60);

    /// Grace period for draining connections on shutdown.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

    /// Outbound connect timeout for the shared HTTP client.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Budget for the one-shot tool-discovery request, scaled by attempt.
    pub const DISCOVERY_BASE: Duration = Duration::from_secs(10);

    /// Per-call budget by method class on HTTP backends.
    #[must_use]
    pub fn http_budget(method: &str) -> Duration {
        if method == "initialize" { HTTP_INITIALIZE } else { HTTP_CALL }
    }

    /// Per-call budget by method class on SSE backends.
    #[must_use]
    pub fn sse_budget(method: &str) -> Duration {
        if method == "initialize" { HTTP_INITIALIZE } else { SSE_REPLY }
    }
}

/// Retry attempt limits. Back-off formulas live with the connectors that use them.
pub mod retry {
    /// Attempts for HTTP backend initialization.
    pub const INIT_ATTEMPTS: u32 = 3;

    /// Attempts for STDIO-TCP connection acquisition.
    pub const STDIO_ATTEMPTS: u32 = 3;

    /// Attempts for a per-backend tool discovery round.
    pub const DISCOVERY_ATTEMPTS: u32 = 3;
}

/// Transport a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Streamable HTTP (spec 2025-03-26): independent POSTs, session header.
    Http,
    /// SSE stream with a learned session endpoint.
    Sse,
    /// Line-delimited JSON-RPC over a long-lived TCP socket.
    StdioTcp,
    /// One spawned process per call, JSON-RPC over stdin/stdout.
    StdioExec,
}

impl TransportKind {
    /// Stable lowercase tag used in logs and API payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Sse => "sse",
            Self::StdioTcp => "stdio-tcp",
            Self::StdioExec => "stdio-exec",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend server behind the gateway. Immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique key; doubles as the first URL path segment on the client side.
    pub name: String,

    /// Transport the backend speaks.
    pub transport: TransportKind,

    /// Network host. Defaults to the compose-style derived name.
    #[serde(default)]
    pub host: Option<String>,

    /// Backend port (HTTP port, SSE port, or stdio hoster port).
    pub port: u16,

    /// Optional HTTP path prefix (e.g. `/mcp`).
    #[serde(default)]
    pub path: Option<String>,

    /// Optional SSE stream path; defaults to `/sse`.
    #[serde(default)]
    pub sse_path: Option<String>,

    /// Command for exec-stdio backends.
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for exec-stdio backends.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment for exec-stdio backends.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Capabilities the backend declares in config (informational).
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Whether the backend requires the gateway's auth gate.
    #[serde(default)]
    pub requires_auth: bool,
}

impl BackendConfig {
    /// Create a minimal descriptor; the rest of the fields take their defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, transport: TransportKind, port: u16) -> Self {
        Self {
            name: name.into(),
            transport,
            host: None,
            port,
            path: None,
            sse_path: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            capabilities: Vec::new(),
            requires_auth: false,
        }
    }

    /// Network host: explicit override or the compose-derived container name.
    #[must_use]
    pub fn host(&self) -> String {
        self.host.clone().unwrap_or_else(|| format!("mcp-compose-{}", self.name))
    }

    /// Base URL for HTTP POSTs (includes the optional path prefix).
    #[must_use]
    pub fn base_url(&self) -> String {
        let prefix = self.path.as_deref().unwrap_or("");
        format!("http://{}:{}{}", self.host(), self.port, prefix)
    }

    /// URL of the SSE stream endpoint.
    #[must_use]
    pub fn sse_url(&self) -> String {
        let path = self.sse_path.as_deref().unwrap_or("/sse");
        format!("http://{}:{}{}", self.host(), self.port, path)
    }

    /// Origin (scheme://host:port) that learned SSE endpoint paths are joined to.
    #[must_use]
    pub fn origin(&self) -> String {
        format!("http://{}:{}", self.host(), self.port)
    }

    /// `host:port` address for the STDIO-TCP socket.
    #[must_use]
    pub fn stdio_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port)
    }
}

/// Top-level gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Client-facing listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional API key; when set, non-OAuth routes require `Authorization: Bearer`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Whether the aggregator `/api/*` endpoints are served.
    #[serde(default = "default_true")]
    pub enable_api: bool,

    /// Backend fleet.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

fn default_port() -> u16 {
    9876
}

const fn default_true() -> bool {
    true
}

impl GatewayConfig {
    /// Create a config with the given backends and defaults elsewhere.
    #[must_use]
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self { port: default_port(), api_key: None, enable_api: true, backends }
    }

    /// Load from a JSON descriptor file (full config-language validation is
    /// handled by the external composer; this only deserializes).
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate backend names; everything else is caller's business.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                anyhow::bail!("duplicate backend name: {}", backend.name);
            }
        }
        Ok(())
    }

    /// Look up a backend descriptor by name.
    #[must_use]
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Whether `name` is a configured backend.
    #[must_use]
    pub fn is_backend(&self, name: &str) -> bool {
        self.backend(name).is_some()
    }

    /// Test configuration: explicit hosts, no auth, short fleet.
    #[must_use]
    pub fn for_testing(backends: Vec<BackendConfig>) -> Self {
        Self { port: 0, api_key: None, enable_api: true, backends }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
