//! Router-level tests: aggregator API, reload semantics, auth gate, CORS.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_gateway::{BackendConfig, GatewayConfig, GatewayServer, TransportKind};

fn backend_for(mock: &MockServer, name: &str) -> BackendConfig {
    let addr = mock.address();
    let mut backend = BackendConfig::new(name, TransportKind::Http, addr.port());
    backend.host = Some(addr.ip().to_string());
    backend
}

async fn mount_minimal_backend(mock: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Mcp-Session-Id", "s1").set_body_json(
                json!({"jsonrpc": "2.0", "id": 1,
                       "result": {"capabilities": {}, "serverInfo": {"name": "m", "version": "1"}}}),
            ),
        )
        .mount(mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "ping"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
        )
        .mount(mock)
        .await;
}

async fn get_json(router: &Router, path: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(path).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_and_ready() {
    let router = GatewayServer::new(GatewayConfig::for_testing(vec![])).unwrap().router();

    let (status, body) = get_json(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "mcp-gateway");

    let (status, body) = get_json(&router, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backends"], 0);
}

#[tokio::test]
async fn test_api_status_reports_uptime_and_counts() {
    let router = GatewayServer::new(GatewayConfig::for_testing(vec![])).unwrap().router();

    let (status, body) = get_json(&router, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeConnections"], 0);
    assert!(body["startedAt"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn test_reload_drains_connections_and_cache() {
    let mock = MockServer::start().await;
    mount_minimal_backend(&mock).await;

    let config = GatewayConfig::for_testing(vec![backend_for(&mock, "weather")]);
    let router = GatewayServer::new(config).unwrap().router();

    // Prime one connection.
    let prime = Request::builder()
        .method("POST")
        .uri("/weather")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string()))
        .unwrap();
    let response = router.clone().oneshot(prime).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, body) = get_json(&router, "/api/connections").await;
    assert_eq!(body["totalActiveManagedConnections"], 1);

    // Reload.
    let reload =
        Request::builder().method("POST").uri("/api/reload").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(reload).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["closedConnections"], 1);
    assert_eq!(body["toolCacheCleared"], true);

    // Registry is empty and the cached tool count dropped to zero.
    let (_, body) = get_json(&router, "/api/connections").await;
    assert_eq!(body["totalActiveManagedConnections"], 0);
    let (_, body) = get_json(&router, "/api/status").await;
    assert_eq!(body["cachedTools"], 0);
}

#[tokio::test]
async fn test_auth_gate_rejects_missing_bearer() {
    let mut config = GatewayConfig::for_testing(vec![]);
    config.api_key = Some("sekrit".to_string());
    let router = GatewayServer::new(config).unwrap().router();

    let (status, body) = get_json(&router, "/api/status").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    // WWW-Authenticate challenge is present.
    let request =
        Request::builder().method("GET").uri("/api/status").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer realm=\"mcp-compose\""
    );
}

#[tokio::test]
async fn test_auth_gate_accepts_valid_bearer_and_spares_health() {
    let mut config = GatewayConfig::for_testing(vec![]);
    config.api_key = Some("sekrit".to_string());
    let router = GatewayServer::new(config).unwrap().router();

    let request = Request::builder()
        .method("GET")
        .uri("/api/status")
        .header(header::AUTHORIZATION, "Bearer sekrit")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Liveness probes bypass the gate.
    let (status, _) = get_json(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cors_preflight_short_circuits() {
    let mut config = GatewayConfig::for_testing(vec![]);
    config.api_key = Some("sekrit".to_string());
    let router = GatewayServer::new(config).unwrap().router();

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/weather")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
}

#[tokio::test]
async fn test_api_servers_roster() {
    let mock = MockServer::start().await;
    mount_minimal_backend(&mock).await;
    // tools/list falls back to the generic tool; the roster still renders.
    let config = GatewayConfig::for_testing(vec![backend_for(&mock, "weather")]);
    let router = GatewayServer::new(config).unwrap().router();

    let (status, body) = get_json(&router, "/api/servers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["servers"][0]["name"], "weather");
    assert_eq!(body["servers"][0]["transport"], "http");
}

#[tokio::test]
async fn test_index_page_lists_endpoints() {
    let router = GatewayServer::new(GatewayConfig::for_testing(vec![])).unwrap().router();
    let (status, body) = get_json(&router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "mcp-gateway");
}

#[tokio::test]
async fn test_unsupported_method_on_backend_route() {
    let mock = MockServer::start().await;
    let config = GatewayConfig::for_testing(vec![backend_for(&mock, "weather")]);
    let router = GatewayServer::new(config).unwrap().router();

    let request = Request::builder().method("PUT").uri("/weather").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
