//! The MCP forwarder: method classification, session relay, and the single
//! point where transport failures become JSON-RPC errors on the client wire.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::StatusCode;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::config::{BackendConfig, GatewayConfig, TransportKind, timeouts};
use crate::error::TransportError;
use crate::registry::ConnectionRegistry;
use crate::rpc::{self, JsonRpcResponse};
use crate::transport::exec;

/// How the forwarder treats a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodClass {
    /// Acked locally with 200 and an empty body; never forwarded.
    ProxyNotification,
    /// Registers the caller as a notification subscriber, then forwards.
    SubscriptionShim,
    /// Forwarded verbatim (includes `initialize` and `ping`).
    Forward,
}

/// Classify a JSON-RPC method name.
#[must_use]
pub fn classify(method: &str) -> MethodClass {
    match method {
        "notifications/initialized" | "notifications/cancelled" => MethodClass::ProxyNotification,
        "resources/subscribe" | "resources/unsubscribe" | "tools/list" | "prompts/list" => {
            MethodClass::SubscriptionShim
        }
        _ => MethodClass::Forward,
    }
}

/// Owns the proxy's own identity and capability advertisement, and decides
/// which methods are acked locally. Pluggable so embedders can advertise
/// their own surface.
pub trait StandardHandler: Send + Sync {
    /// `serverInfo` advertised for the proxy itself.
    fn server_info(&self) -> Value;

    /// Capabilities advertised for the proxy itself.
    fn capabilities(&self) -> Value;

    /// Whether the method is acked locally instead of forwarded.
    fn handles_locally(&self, method: &str) -> bool {
        classify(method) == MethodClass::ProxyNotification
    }
}

/// Default advertisement for this gateway build.
#[derive(Debug, Default)]
pub struct GatewayStandardHandler;

impl StandardHandler for GatewayStandardHandler {
    fn server_info(&self) -> Value {
        json!({
            "name": "mcp-gateway",
            "version": env!("CARGO_PKG_VERSION"),
        })
    }

    fn capabilities(&self) -> Value {
        json!({
            "tools": {"listChanged": false},
            "resources": {"subscribe": true},
        })
    }
}

/// Clients that asked to hear about backend notifications, per backend.
/// Delivery itself happens out-of-band; this only tracks who asked.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    inner: RwLock<HashMap<String, HashSet<String>>>,
}

impl SubscriberRegistry {
    pub async fn register(&self, backend: &str, client_id: &str) {
        let mut inner = self.inner.write().await;
        let added = inner.entry(backend.to_string()).or_default().insert(client_id.to_string());
        if added {
            tracing::debug!(backend = %backend, client = %client_id, "registered notification subscriber");
        }
    }

    pub async fn subscribers(&self, backend: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .get(backend)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

/// Derive a client identity for subscription bookkeeping: session id, then
/// the explicit client header, then the remote address, then a fresh uuid.
#[must_use]
pub fn derive_client_id(
    sid: Option<&str>,
    client_header: Option<&str>,
    remote: Option<&str>,
) -> String {
    sid.or(client_header)
        .or(remote)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

/// What the router writes back to the client.
#[derive(Debug)]
pub struct ForwardReply {
    pub status: StatusCode,
    pub body: Option<Value>,
    pub sid: Option<String>,
}

impl ForwardReply {
    fn ok(body: Value, sid: Option<String>) -> Self {
        Self { status: StatusCode::OK, body: Some(body), sid }
    }

    fn empty(sid: Option<String>) -> Self {
        Self { status: StatusCode::OK, body: None, sid }
    }
}

/// Forwards JSON-RPC envelopes to backend connections.
pub struct Forwarder {
    config: Arc<GatewayConfig>,
    registry: Arc<ConnectionRegistry>,
    subscribers: SubscriberRegistry,
    standard: Arc<dyn StandardHandler>,
    next_direct_id: AtomicU64,
}

impl Forwarder {
    #[must_use]
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<ConnectionRegistry>,
        standard: Arc<dyn StandardHandler>,
    ) -> Self {
        Self {
            config,
            registry,
            subscribers: SubscriberRegistry::default(),
            standard,
            next_direct_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn standard(&self) -> &dyn StandardHandler {
        self.standard.as_ref()
    }

    #[must_use]
    pub const fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    /// Forward one parsed JSON-RPC envelope to a backend.
    pub async fn forward(
        &self,
        backend: &BackendConfig,
        request: Value,
        client_sid: Option<&str>,
        client_id: &str,
    ) -> ForwardReply {
        let id = request.get("id").cloned();
        let Some(method) = request.get("method").and_then(Value::as_str).map(str::to_string)
        else {
            let body = JsonRpcResponse::error(
                id,
                rpc::code::INVALID_REQUEST,
                "request carries no method",
            );
            return ForwardReply {
                status: StatusCode::BAD_REQUEST,
                body: serde_json::to_value(body).ok(),
                sid: None,
            };
        };

        match classify(&method) {
            MethodClass::ProxyNotification if self.standard.handles_locally(&method) => {
                // Local ack; the connector-level initialized notification was
                // already sent when the backend session came up.
                let sid = self.current_sid(backend).await;
                return ForwardReply::empty(sid);
            }
            MethodClass::SubscriptionShim => {
                self.subscribers.register(&backend.name, client_id).await;
            }
            _ => {}
        }

        self.dispatch(backend, request, id, &method, client_sid).await
    }

    async fn dispatch(
        &self,
        backend: &BackendConfig,
        request: Value,
        id: Option<Value>,
        method: &str,
        client_sid: Option<&str>,
    ) -> ForwardReply {
        let is_notification = id.is_none();

        match backend.transport {
            TransportKind::Http => {
                let conn = match self.registry.http_connection(backend).await {
                    Ok(conn) => conn,
                    Err(err) => return self.error_reply(id, &err, None),
                };
                conn.relay_sid(client_sid).await;

                if is_notification {
                    if let Err(err) = conn.notify(&request).await {
                        tracing::warn!(backend = %backend.name, error = %err, "notification forward failed");
                    }
                    return ForwardReply::empty(conn.sid().await);
                }

                let budget = timeouts::http_budget(method);
                match conn.call(&request, budget).await {
                    Ok(reply) => ForwardReply::ok(reply, conn.sid().await),
                    Err(err) => self.error_reply(id, &err, conn.sid().await),
                }
            }
            TransportKind::Sse => {
                let conn = match self.registry.sse_connection(backend).await {
                    Ok(conn) => conn,
                    Err(err) => return self.error_reply(id, &err, None),
                };
                conn.relay_sid(client_sid).await;

                let budget = timeouts::sse_budget(method);
                match conn.call(&request, budget).await {
                    Ok(reply) => ForwardReply::ok(reply, conn.sid().await),
                    Err(err) => {
                        if is_notification {
                            tracing::warn!(backend = %backend.name, error = %err, "notification forward failed");
                            return ForwardReply::empty(conn.sid().await);
                        }
                        self.error_reply(id, &err, conn.sid().await)
                    }
                }
            }
            TransportKind::StdioTcp => {
                let conn = match self.registry.stdio_connection(backend).await {
                    Ok(conn) => conn,
                    Err(err) => return self.error_reply(id, &err, None),
                };
                conn.relay_sid(client_sid).await;

                match conn.call(&request).await {
                    Ok(Some(reply)) => ForwardReply::ok(reply, conn.sid().await),
                    Ok(None) => ForwardReply::empty(conn.sid().await),
                    Err(err) => {
                        if is_notification {
                            tracing::warn!(backend = %backend.name, error = %err, "notification forward failed");
                            return ForwardReply::empty(conn.sid().await);
                        }
                        self.error_reply(id, &err, conn.sid().await)
                    }
                }
            }
            TransportKind::StdioExec => match exec::call(backend, &request).await {
                Ok(_) if is_notification => ForwardReply::empty(None),
                Ok(reply) => ForwardReply::ok(reply, None),
                Err(err) if is_notification => {
                    tracing::warn!(backend = %backend.name, error = %err, "notification forward failed");
                    ForwardReply::empty(None)
                }
                Err(err) => self.error_reply(id, &err, None),
            },
        }
    }

    /// Wrap bare tool arguments in a `tools/call` envelope and forward it.
    /// Returns the raw JSON-RPC reply; the router post-processes the result.
    pub async fn direct_tool_call(
        &self,
        backend: &BackendConfig,
        tool: &str,
        arguments: Value,
        client_sid: Option<&str>,
        client_id: &str,
    ) -> ForwardReply {
        let id = self.next_direct_id.fetch_add(1, Ordering::Relaxed);
        let request = rpc::request(
            json!(format!("direct-{id}")),
            "tools/call",
            json!({
                "name": tool,
                "arguments": arguments,
            }),
        );
        self.forward(backend, request, client_sid, client_id).await
    }

    /// Client-initiated session termination.
    ///
    /// HTTP backends get the DELETE forwarded with the client's session id;
    /// the proxy's own session state clears regardless of the outcome. Other
    /// transports only carry proxy-local session identity, so the clear is
    /// local and answered with 200.
    pub async fn terminate_session(
        &self,
        backend: &BackendConfig,
        client_sid: &str,
    ) -> (StatusCode, Value) {
        match backend.transport {
            TransportKind::Http => {
                let outcome = match self.registry.peek_http(&backend.name).await {
                    Some(conn) => conn.terminate_session(client_sid).await,
                    None => {
                        // No live connection; still forward the DELETE so the
                        // backend can retire its session.
                        let result = self
                            .registry
                            .http_client()
                            .delete(backend.base_url())
                            .header(crate::transport::SESSION_HEADER, client_sid)
                            .timeout(timeouts::HTTP_PING)
                            .send()
                            .await;
                        match result {
                            Ok(response) => {
                                let status = response.status().as_u16();
                                let body = response.bytes().await.unwrap_or_default();
                                Ok((status, body))
                            }
                            Err(err) => Err(TransportError::from_reqwest(err)),
                        }
                    }
                };

                match outcome {
                    Ok((405, _)) => (
                        StatusCode::METHOD_NOT_ALLOWED,
                        json!({
                            "error": "session termination not allowed",
                            "message": format!(
                                "backend {} does not allow client-initiated session termination",
                                backend.name
                            ),
                        }),
                    ),
                    Ok((status, body)) => {
                        let parsed = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| {
                            json!({"message": String::from_utf8_lossy(&body).to_string()})
                        });
                        (
                            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                            parsed,
                        )
                    }
                    Err(err) => (
                        StatusCode::BAD_GATEWAY,
                        json!({
                            "error": "session termination failed",
                            "message": err.to_string(),
                        }),
                    ),
                }
            }
            TransportKind::Sse => {
                if let Some(conn) = self.registry.peek_sse(&backend.name).await {
                    conn.clear_session().await;
                }
                (StatusCode::OK, json!({"status": "session cleared"}))
            }
            TransportKind::StdioTcp => {
                if let Some(conn) = self.registry.peek_stdio(&backend.name).await {
                    conn.clear_session().await;
                }
                (StatusCode::OK, json!({"status": "session cleared"}))
            }
            TransportKind::StdioExec => (StatusCode::OK, json!({"status": "session cleared"})),
        }
    }

    /// Proxy-held session id for a backend, without creating a connection.
    pub async fn current_sid(&self, backend: &BackendConfig) -> Option<String> {
        match backend.transport {
            TransportKind::Http => match self.registry.peek_http(&backend.name).await {
                Some(conn) => conn.sid().await,
                None => None,
            },
            TransportKind::Sse => match self.registry.peek_sse(&backend.name).await {
                Some(conn) => conn.sid().await,
                None => None,
            },
            TransportKind::StdioTcp => match self.registry.peek_stdio(&backend.name).await {
                Some(conn) => conn.sid().await,
                None => None,
            },
            TransportKind::StdioExec => None,
        }
    }

    fn error_reply(
        &self,
        id: Option<Value>,
        err: &TransportError,
        sid: Option<String>,
    ) -> ForwardReply {
        let body = JsonRpcResponse::error(id, err.rpc_code(), err.to_string());
        ForwardReply {
            status: StatusCode::OK,
            body: serde_json::to_value(body).ok(),
            sid,
        }
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("notifications/initialized"), MethodClass::ProxyNotification);
        assert_eq!(classify("notifications/cancelled"), MethodClass::ProxyNotification);
        assert_eq!(classify("tools/list"), MethodClass::SubscriptionShim);
        assert_eq!(classify("resources/subscribe"), MethodClass::SubscriptionShim);
        assert_eq!(classify("initialize"), MethodClass::Forward);
        assert_eq!(classify("ping"), MethodClass::Forward);
        assert_eq!(classify("tools/call"), MethodClass::Forward);
    }

    #[test]
    fn test_derive_client_id_order() {
        assert_eq!(derive_client_id(Some("s1"), Some("c1"), Some("1.2.3.4")), "s1");
        assert_eq!(derive_client_id(None, Some("c1"), Some("1.2.3.4")), "c1");
        assert_eq!(derive_client_id(None, None, Some("1.2.3.4")), "1.2.3.4");
        // uuid fallback is unique per call
        let a = derive_client_id(None, None, None);
        let b = derive_client_id(None, None, None);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_subscriber_registry() {
        let registry = SubscriberRegistry::default();
        registry.register("weather", "client-1").await;
        registry.register("weather", "client-1").await;
        registry.register("weather", "client-2").await;

        let mut subs = registry.subscribers("weather").await;
        subs.sort();
        assert_eq!(subs, vec!["client-1", "client-2"]);
        assert!(registry.subscribers("cron").await.is_empty());

        registry.clear().await;
        assert!(registry.subscribers("weather").await.is_empty());
    }

    #[test]
    fn test_standard_handler_advertisement() {
        let handler = GatewayStandardHandler;
        assert_eq!(handler.server_info()["name"], "mcp-gateway");
        assert!(handler.handles_locally("notifications/initialized"));
        assert!(!handler.handles_locally("initialize"));
        assert!(!handler.handles_locally("ping"));
    }
}
