//! Aggregator and administrative endpoints under `/api`.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

use super::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mcp-gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counts = state.registry.counts().await;
    Json(json!({
        "status": "ready",
        "service": "mcp-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "backends": state.config.backends.len(),
        "connections": counts.total,
    }))
}

/// Backend roster with connection state.
pub async fn api_servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut servers = Vec::with_capacity(state.config.backends.len());
    for backend in &state.config.backends {
        let tools = state.tools.tools_for_backend(&backend.name).await;
        let conn = connection_state(&state, backend).await;
        let subscribers = state.forwarder.subscribers().subscribers(&backend.name).await;
        servers.push(json!({
            "name": backend.name,
            "transport": backend.transport.as_str(),
            "capabilities": backend.capabilities,
            "toolCount": tools.len(),
            "initialized": conn.initialized,
            "healthy": conn.healthy,
            "serverInfo": conn.server_info,
            "subscriberCount": subscribers.len(),
        }));
    }
    Json(json!({"servers": servers}))
}

struct ConnState {
    initialized: bool,
    healthy: bool,
    server_info: serde_json::Value,
}

async fn connection_state(state: &AppState, backend: &crate::config::BackendConfig) -> ConnState {
    use crate::config::TransportKind;
    match backend.transport {
        TransportKind::Http => match state.registry.peek_http(&backend.name).await {
            Some(conn) => ConnState {
                initialized: conn.is_initialized(),
                healthy: conn.is_healthy(),
                server_info: conn.server_info().await,
            },
            None => ConnState::absent(),
        },
        TransportKind::Sse => match state.registry.peek_sse(&backend.name).await {
            Some(conn) => ConnState {
                initialized: conn.is_initialized(),
                healthy: conn.is_healthy(),
                server_info: conn.server_info().await,
            },
            None => ConnState::absent(),
        },
        TransportKind::StdioTcp => match state.registry.peek_stdio(&backend.name).await {
            Some(conn) => ConnState {
                initialized: conn.is_initialized(),
                healthy: conn.is_healthy(),
                server_info: conn.server_info().await,
            },
            None => ConnState::absent(),
        },
        TransportKind::StdioExec => ConnState {
            initialized: false,
            healthy: true,
            server_info: serde_json::Value::Null,
        },
    }
}

impl ConnState {
    const fn absent() -> Self {
        Self { initialized: false, healthy: false, server_info: serde_json::Value::Null }
    }
}

/// Gateway status and uptime.
pub async fn api_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counts = state.registry.counts().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at_utc.to_rfc3339(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "backends": state.config.backends.len(),
        "activeConnections": counts.total,
        "cachedTools": state.tools.tool_count().await,
    }))
}

/// Aggregated discovery document: the proxy's own advertisement plus every
/// backend's tool list.
pub async fn api_discovery(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let all = state.tools.all_tools().await;
    let mut servers = Vec::with_capacity(state.config.backends.len());
    for backend in &state.config.backends {
        let tools = all.get(&backend.name).cloned().unwrap_or_default();
        servers.push(json!({
            "name": backend.name,
            "transport": backend.transport.as_str(),
            "tools": tools,
        }));
    }

    Json(json!({
        "serverInfo": state.forwarder.standard().server_info(),
        "capabilities": state.forwarder.standard().capabilities(),
        "servers": servers,
    }))
}

/// Live connection detail rows.
pub async fn api_connections(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counts = state.registry.counts().await;
    let connections = state.registry.connection_details().await;
    Json(json!({
        "totalActiveManagedConnections": counts.total,
        "countsByTransport": {
            "http": counts.http,
            "sse": counts.sse,
            "stdio-tcp": counts.stdio,
        },
        "connections": connections,
    }))
}

/// Drain every connection and expire the tool cache without restarting.
pub async fn api_reload(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let closed = state.registry.close_all().await;
    state.tools.clear().await;
    state.openapi.invalidate_all();
    state.forwarder.subscribers().clear().await;

    tracing::info!(closed, "gateway reloaded");
    Json(json!({
        "status": "reloaded",
        "closedConnections": closed,
        "toolCacheCleared": true,
    }))
}
