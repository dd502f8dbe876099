//! The authentication gate.
//!
//! API-key checks happen here; OAuth bearer validation is delegated through
//! the [`BearerValidator`] seam so an external authorization server can be
//! plugged in without touching the router. OAuth discovery and token
//! endpoints always bypass the gate.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use serde_json::json;

use super::AppState;

/// Validates bearer tokens. The default implementation compares against the
/// configured API key; an OAuth deployment substitutes its own validator.
#[async_trait]
pub trait BearerValidator: Send + Sync {
    async fn validate(&self, token: &str) -> bool;
}

/// Accepts exactly the configured API key.
#[derive(Debug)]
pub struct ApiKeyValidator {
    key: String,
}

impl ApiKeyValidator {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl BearerValidator for ApiKeyValidator {
    async fn validate(&self, token: &str) -> bool {
        token == self.key
    }
}

/// No-op validator used when no API key is configured.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl BearerValidator for AllowAll {
    async fn validate(&self, _token: &str) -> bool {
        true
    }
}

/// Paths handled before authentication: OAuth discovery and token endpoints,
/// plus the liveness probes.
#[must_use]
pub fn bypasses_auth(path: &str) -> bool {
    path.starts_with("/.well-known/")
        || path == "/authorize"
        || path == "/token"
        || path == "/register"
        || path == "/health"
        || path == "/ready"
}

/// Router middleware enforcing the gate.
pub async fn auth_gate(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Response {
    // Preflight is answered by the CORS layer.
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if bypasses_auth(request.uri().path()) {
        return next.run(request).await;
    }
    if state.config.api_key.is_none() {
        return next.run(request).await;
    }

    match bearer {
        Some(TypedHeader(bearer)) if state.validator.validate(bearer.token()).await => {
            next.run(request).await
        }
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "error_description": "missing or invalid bearer token",
        })),
    )
        .into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Bearer realm=\"mcp-compose\""),
    );
    response
}
