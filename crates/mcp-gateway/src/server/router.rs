//! Client-facing URL scheme.
//!
//! Fixed routes cover the aggregator API and OpenAPI documents; everything
//! else falls through to the dynamic handler, which resolves the first path
//! segment as a backend name or, for POSTs, as a discovered tool name.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{AppState, api, auth};
use crate::config::BackendConfig;
use crate::content::postprocess_tool_result;
use crate::error::GatewayError;
use crate::forwarder::{ForwardReply, derive_client_id};
use crate::rpc::{self, JsonRpcRequest, JsonRpcResponse};
use crate::transport::SESSION_HEADER;

/// Build the full client-facing router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(api::health_check))
        .route("/ready", get(api::readiness_check))
        .route("/openapi.json", get(openapi_merged));

    if state.config.enable_api {
        router = router
            .route("/api/servers", get(api::api_servers))
            .route("/api/status", get(api::api_status))
            .route("/api/discovery", get(api::api_discovery))
            .route("/api/connections", get(api::api_connections))
            .route("/api/reload", post(api::api_reload));
    }

    router
        .fallback(dynamic_handler)
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth::auth_gate))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi_merged(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.openapi.merged_spec().await)
}

/// Largest request body the gateway buffers.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Resolve `/{name}` and `/{name}/...` requests.
async fn dynamic_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, raw_body) = request.into_parts();
    let method = parts.method;
    let headers = parts.headers;

    // Preflight short-circuits; the CORS layer decorates the response.
    if method == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }

    let body = match axum::body::to_bytes(raw_body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    let path = parts.uri.path();
    let segments: Vec<&str> =
        path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    let Some(&name) = segments.first() else {
        return index_page();
    };

    let client_sid = header_str(&headers, SESSION_HEADER);
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    let client_id = derive_client_id(
        client_sid.as_deref(),
        header_str(&headers, "X-Client-ID").as_deref(),
        remote_addr.as_deref(),
    );

    if let Some(backend) = state.config.backend(name) {
        return match method {
            Method::POST => {
                backend_post(&state, backend, &headers, client_sid.as_deref(), &client_id, &body)
                    .await
            }
            Method::DELETE => backend_delete(&state, backend, client_sid.as_deref()).await,
            Method::GET if segments.get(1) == Some(&"openapi.json") => {
                Json(state.openapi.spec_for_backend(&backend.name).await).into_response()
            }
            Method::GET => backend_details(&state, backend).await,
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }

    if method == Method::POST && state.tools.is_known_tool(name).await {
        return direct_tool_call(&state, name, client_sid.as_deref(), &client_id, &body).await;
    }

    not_found(name, &method, &body)
}

async fn backend_post(
    state: &AppState,
    backend: &BackendConfig,
    headers: &HeaderMap,
    client_sid: Option<&str>,
    client_id: &str,
    body: &Bytes,
) -> Response {
    let request: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            let error = JsonRpcResponse::error(
                Some(Value::Null),
                rpc::code::PARSE_ERROR,
                format!("invalid JSON: {err}"),
            );
            return (StatusCode::BAD_REQUEST, Json(error)).into_response();
        }
    };

    // Valid JSON but not a JSON-RPC envelope.
    if serde_json::from_value::<JsonRpcRequest>(request.clone()).is_err() {
        let id = request.get("id").cloned().or(Some(Value::Null));
        let err = GatewayError::InvalidRequest("body is not a JSON-RPC 2.0 request".to_string());
        let error = JsonRpcResponse::error(id, err.rpc_code(), err.to_string());
        return (StatusCode::BAD_REQUEST, Json(error)).into_response();
    }

    // A client declaring notification support subscribes its identity even
    // before any shim method arrives.
    let wants_notifications = header_str(headers, "X-Supports-Notifications").as_deref()
        == Some("true")
        || header_str(headers, "X-MCP-Capabilities")
            .is_some_and(|caps| caps.split(',').any(|c| c.trim() == "notifications"));
    if wants_notifications {
        state.forwarder.subscribers().register(&backend.name, client_id).await;
    }

    let reply = state.forwarder.forward(backend, request, client_sid, client_id).await;
    reply_response(reply)
}

async fn backend_delete(
    state: &AppState,
    backend: &BackendConfig,
    client_sid: Option<&str>,
) -> Response {
    let Some(client_sid) = client_sid else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "missing session",
                "message": "DELETE requires the Mcp-Session-Id header",
            })),
        )
            .into_response();
    };

    let (status, body) = state.forwarder.terminate_session(backend, client_sid).await;
    (status, Json(body)).into_response()
}

async fn backend_details(state: &AppState, backend: &BackendConfig) -> Response {
    let tools = state.tools.tools_for_backend(&backend.name).await;
    Json(json!({
        "name": backend.name,
        "transport": backend.transport.as_str(),
        "capabilities": backend.capabilities,
        "tools": tools,
    }))
    .into_response()
}

async fn direct_tool_call(
    state: &AppState,
    tool: &str,
    client_sid: Option<&str>,
    client_id: &str,
    body: &Bytes,
) -> Response {
    let arguments: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(err) => {
                let error = JsonRpcResponse::error(
                    Some(Value::Null),
                    rpc::code::PARSE_ERROR,
                    format!("invalid JSON arguments: {err}"),
                );
                return (StatusCode::BAD_REQUEST, Json(error)).into_response();
            }
        }
    };

    let Some(owner) = state.tools.find_server_for_tool(tool).await else {
        return tool_gone(tool);
    };
    let Some(backend) = state.config.backend(&owner) else {
        return tool_gone(tool);
    };

    let reply =
        state.forwarder.direct_tool_call(backend, tool, arguments, client_sid, client_id).await;

    let sid = reply.sid.clone();
    let body = match reply.body {
        Some(body) if body.get("error").is_some() => body,
        Some(body) => match body.get("result") {
            Some(result) => postprocess_tool_result(result),
            None => body,
        },
        None => json!(null),
    };
    with_session_header((reply.status, Json(body)).into_response(), sid)
}

fn tool_gone(tool: &str) -> Response {
    let err = GatewayError::UnknownBackend(tool.to_string());
    let error = JsonRpcResponse::error(Some(Value::Null), err.rpc_code(), err.to_string());
    (StatusCode::NOT_FOUND, Json(error)).into_response()
}

fn not_found(name: &str, method: &Method, body: &Bytes) -> Response {
    if method == Method::POST {
        // Preserve the caller's id in the synthesized error where possible.
        let id = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .or(Some(Value::Null));
        let err = GatewayError::UnknownBackend(name.to_string());
        let error = JsonRpcResponse::error(id, err.rpc_code(), err.to_string());
        return (StatusCode::NOT_FOUND, Json(error)).into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not found", "message": format!("no route for '{name}'")})),
    )
        .into_response()
}

fn index_page() -> Response {
    Json(json!({
        "service": "mcp-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/api/servers", "/api/status", "/api/discovery", "/api/connections", "/openapi.json"],
    }))
    .into_response()
}

fn reply_response(reply: ForwardReply) -> Response {
    let sid = reply.sid.clone();
    let response = match reply.body {
        Some(body) => (reply.status, Json(body)).into_response(),
        None => reply.status.into_response(),
    };
    with_session_header(response, sid)
}

fn with_session_header(mut response: Response, sid: Option<String>) -> Response {
    if let Some(sid) = sid {
        if let Ok(value) = HeaderValue::from_str(&sid) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    response
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}
