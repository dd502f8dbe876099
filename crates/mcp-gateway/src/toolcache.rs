//! Tool discovery and the tool→backend reverse index.
//!
//! One snapshot with a single shared TTL covers the whole fleet. Lookups are
//! plain readers of the current snapshot; discovery runs with no lock held
//! and the write lock covers only the expiry check and the map swap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::config::{BackendConfig, GatewayConfig, TransportKind, retry, timeouts};
use crate::error::{TransportError, TransportResult};
use crate::registry::ConnectionRegistry;
use crate::rpc;
use crate::transport::stdio_tcp::StdioTcpConnection;

/// One discovered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Default)]
struct Snapshot {
    /// tool name → owning backend. At most one owner per tool.
    owners: HashMap<String, String>,
    /// backend → its discovered tools.
    by_backend: HashMap<String, Vec<ToolDescriptor>>,
    expires_at: Option<Instant>,
}

impl Snapshot {
    fn is_fresh(&self) -> bool {
        self.expires_at.is_some_and(|at| at > Instant::now())
    }
}

/// Fleet-wide tool cache with lazy TTL refresh.
pub struct ToolCache {
    config: Arc<GatewayConfig>,
    registry: Arc<ConnectionRegistry>,
    inner: RwLock<Snapshot>,
}

impl ToolCache {
    #[must_use]
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { config, registry, inner: RwLock::new(Snapshot::default()) }
    }

    /// Whether a tool name is currently routable.
    pub async fn is_known_tool(&self, name: &str) -> bool {
        self.ensure_fresh().await;
        self.inner.read().await.owners.contains_key(name)
    }

    /// Backend owning a tool, if any.
    pub async fn find_server_for_tool(&self, name: &str) -> Option<String> {
        self.ensure_fresh().await;
        self.inner.read().await.owners.get(name).cloned()
    }

    /// Tools discovered for one backend.
    pub async fn tools_for_backend(&self, backend: &str) -> Vec<ToolDescriptor> {
        self.ensure_fresh().await;
        self.inner.read().await.by_backend.get(backend).cloned().unwrap_or_default()
    }

    /// The whole backend→tools map.
    pub async fn all_tools(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        self.ensure_fresh().await;
        self.inner.read().await.by_backend.clone()
    }

    /// Total number of cached tools.
    pub async fn tool_count(&self) -> usize {
        self.inner.read().await.owners.len()
    }

    /// Force a refresh regardless of TTL. Returns the new tool count.
    pub async fn force_refresh(&self) -> usize {
        let (owners, by_backend) = self.discover_all().await;
        let count = owners.len();
        let mut inner = self.inner.write().await;
        *inner = Snapshot {
            owners,
            by_backend,
            expires_at: Some(Instant::now() + timeouts::TOOL_CACHE_TTL),
        };
        count
    }

    /// Drop every entry and expire the window (used by reload).
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Snapshot::default();
        tracing::info!("tool cache cleared");
    }

    async fn ensure_fresh(&self) {
        if self.inner.read().await.is_fresh() {
            return;
        }

        // Discovery happens outside any lock; the swap below re-checks in
        // case a concurrent refresh won the race.
        let (owners, by_backend) = self.discover_all().await;

        let mut inner = self.inner.write().await;
        if inner.is_fresh() {
            return;
        }
        *inner = Snapshot {
            owners,
            by_backend,
            expires_at: Some(Instant::now() + timeouts::TOOL_CACHE_TTL),
        };
    }

    async fn discover_all(
        &self,
    ) -> (HashMap<String, String>, HashMap<String, Vec<ToolDescriptor>>) {
        let mut owners = HashMap::new();
        let mut by_backend = HashMap::new();

        for backend in &self.config.backends {
            let tools = match self.discover_backend(backend).await {
                Ok(Some(tools)) => tools,
                Ok(None) => {
                    tracing::debug!(backend = %backend.name, "no tool list, using generic fallback");
                    vec![fallback_tool(&backend.name)]
                }
                Err(err) => {
                    tracing::warn!(backend = %backend.name, error = %err, "tool discovery failed, using generic fallback");
                    vec![fallback_tool(&backend.name)]
                }
            };
            merge_backend_tools(&mut owners, &mut by_backend, &backend.name, tools);
        }

        tracing::info!(
            tools = owners.len(),
            backends = by_backend.len(),
            "tool discovery round complete"
        );
        (owners, by_backend)
    }

    /// Discover one backend with retry. Only connect-class and timeout-class
    /// failures are retried; protocol errors are authoritative.
    async fn discover_backend(
        &self,
        backend: &BackendConfig,
    ) -> TransportResult<Option<Vec<ToolDescriptor>>> {
        let mut attempt = 1;
        loop {
            let budget = timeouts::DISCOVERY_BASE * attempt;
            match self.dispatch_discovery(backend, budget).await {
                Ok(reply) => return Ok(parse_tools(&reply)),
                Err(err) if attempt < retry::DISCOVERY_ATTEMPTS && err.is_retryable() => {
                    let wait = std::time::Duration::from_secs(2 * u64::from(attempt));
                    tracing::warn!(
                        backend = %backend.name,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "tool discovery attempt failed"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch_discovery(
        &self,
        backend: &BackendConfig,
        budget: std::time::Duration,
    ) -> TransportResult<Value> {
        match backend.transport {
            TransportKind::Http => {
                let conn = self.registry.http_connection(backend).await?;
                let request = rpc::request(json!("tools-list"), "tools/list", Value::Null);
                conn.call(&request, budget).await
            }
            TransportKind::Sse => {
                let conn = self.registry.sse_connection(backend).await?;
                conn.call_method("tools/list", Value::Null, budget).await
            }
            TransportKind::StdioTcp => {
                // Fresh ephemeral connection so startup probing never
                // pollutes the long-lived pool.
                tokio::time::timeout(budget, StdioTcpConnection::discover_tools(backend))
                    .await
                    .map_err(|_| TransportError::Timeout(budget))?
            }
            // No process spawning during discovery; exec backends always get
            // the generic fallback.
            TransportKind::StdioExec => Ok(Value::Null),
        }
    }
}

impl std::fmt::Debug for ToolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCache").finish()
    }
}

/// Extract `result.tools[]`; `None` means the backend gave no usable list.
fn parse_tools(reply: &Value) -> Option<Vec<ToolDescriptor>> {
    let tools = reply.get("result")?.get("tools")?.as_array()?;
    let parsed = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?.to_string();
            Some(ToolDescriptor {
                name,
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
        })
        .collect();
    Some(parsed)
}

/// Generic single tool for backends that expose no list.
fn fallback_tool(backend: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: format!("{backend}_execute"),
        description: format!("Execute a raw JSON-RPC method on the {backend} backend"),
        input_schema: json!({
            "type": "object",
            "properties": {
                "method": {"type": "string"},
                "params": {"type": "object"},
            },
            "required": ["method"],
        }),
    }
}

/// Fold one backend's tools into the maps. On a name collision the
/// last-discovered backend wins.
fn merge_backend_tools(
    owners: &mut HashMap<String, String>,
    by_backend: &mut HashMap<String, Vec<ToolDescriptor>>,
    backend: &str,
    tools: Vec<ToolDescriptor>,
) {
    for tool in &tools {
        if let Some(prev) = owners.insert(tool.name.clone(), backend.to_string()) {
            if prev != backend {
                tracing::warn!(
                    tool = %tool.name,
                    previous = %prev,
                    winner = %backend,
                    "tool name collision, last-discovered wins"
                );
            }
        }
    }
    by_backend.insert(backend.to_string(), tools);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tools() {
        let reply = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "tools": [
                    {"name": "get_weather", "description": "Weather lookup",
                     "inputSchema": {"type": "object", "properties": {"city": {"type": "string"}}}},
                    {"name": "bare_tool"},
                    {"description": "nameless, skipped"},
                ]
            }
        });
        let tools = parse_tools(&reply).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "get_weather");
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[test]
    fn test_parse_tools_no_array() {
        assert!(parse_tools(&json!({"result": {}})).is_none());
        assert!(parse_tools(&json!({"error": {"code": -32601, "message": "nope"}})).is_none());
        assert!(parse_tools(&Value::Null).is_none());
    }

    #[test]
    fn test_fallback_tool_shape() {
        let tool = fallback_tool("cron");
        assert_eq!(tool.name, "cron_execute");
        assert_eq!(tool.input_schema["required"][0], "method");
    }

    #[test]
    fn test_collision_last_wins() {
        let mut owners = HashMap::new();
        let mut by_backend = HashMap::new();

        let tool = |name: &str| ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        };

        merge_backend_tools(&mut owners, &mut by_backend, "alpha", vec![tool("shared")]);
        merge_backend_tools(&mut owners, &mut by_backend, "beta", vec![tool("shared")]);

        assert_eq!(owners.get("shared"), Some(&"beta".to_string()));
        assert_eq!(by_backend.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_fleet_cache() {
        use tokio_util::sync::CancellationToken;

        let config = Arc::new(GatewayConfig::for_testing(Vec::new()));
        let registry = Arc::new(ConnectionRegistry::new(CancellationToken::new()).unwrap());
        let cache = ToolCache::new(config, registry);

        assert!(!cache.is_known_tool("anything").await);
        assert_eq!(cache.tool_count().await, 0);
        // cache coherence: unknown tool has no owner
        assert!(cache.find_server_for_tool("anything").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_empties_snapshot() {
        use tokio_util::sync::CancellationToken;

        let config = Arc::new(GatewayConfig::for_testing(Vec::new()));
        let registry = Arc::new(ConnectionRegistry::new(CancellationToken::new()).unwrap());
        let cache = ToolCache::new(config, registry);

        cache.force_refresh().await;
        cache.clear().await;
        assert_eq!(cache.tool_count().await, 0);
    }
}
