//! Direct tool-call facade and tool-discovery tests against a mocked backend.

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

/// Mount handshake, discovery, and tool execution mocks for a weather backend.
async fn mount_weather_backend(mock: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Mcp-Session-Id", "w1").set_body_json(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": "2025-03-26",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "weather", "version": "1.0"}
                    }
                }),
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
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "tools": [{
                    "name": "get_weather",
                    "description": "Current weather for a city",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"city": {"type": "string"}},
                        "required": ["city"]
                    }
                }]
            }
        })))
        .mount(mock)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": {"name": "get_weather", "arguments": {"city": "Paris"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"content": [{"type": "text", "text": "{\"t\":12}"}]}
        })))
        .mount(mock)
        .await;
}

fn gateway_router(backends: Vec<BackendConfig>) -> Router {
    let config = GatewayConfig::for_testing(backends);
    GatewayServer::new(config).unwrap().router()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_direct_tool_call_posts_bare_arguments() {
    let mock = MockServer::start().await;
    mount_weather_backend(&mock).await;

    let router = gateway_router(vec![backend_for(&mock, "weather")]);

    // The tool name is not a backend name; the cache resolves it.
    let (status, body) = send(&router, post("/get_weather", &json!({"city": "Paris"}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"t": 12}));
}

#[tokio::test]
async fn test_unknown_tool_and_backend_is_404() {
    let mock = MockServer::start().await;
    mount_weather_backend(&mock).await;

    let router = gateway_router(vec![backend_for(&mock, "weather")]);

    let (status, body) = send(&router, post("/no_such_tool", &json!({"x": 1}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], -32002);
}

#[tokio::test]
async fn test_backend_openapi_has_tool_operation() {
    let mock = MockServer::start().await;
    mount_weather_backend(&mock).await;

    let router = gateway_router(vec![backend_for(&mock, "weather")]);

    let request =
        Request::builder().method("GET").uri("/weather/openapi.json").body(Body::empty()).unwrap();
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["openapi"], "3.1.0");
    let op = &body["paths"]["/get_weather"]["post"];
    assert_eq!(op["operationId"], "get_weather");
    assert_eq!(
        op["requestBody"]["content"]["application/json"]["schema"]["required"][0],
        "city"
    );
}

#[tokio::test]
async fn test_merged_openapi_covers_fleet() {
    let mock = MockServer::start().await;
    mount_weather_backend(&mock).await;

    let router = gateway_router(vec![backend_for(&mock, "weather")]);

    let request =
        Request::builder().method("GET").uri("/openapi.json").body(Body::empty()).unwrap();
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/get_weather"].is_object());
}

#[tokio::test]
async fn test_discovery_lists_backend_tools() {
    let mock = MockServer::start().await;
    mount_weather_backend(&mock).await;

    let router = gateway_router(vec![backend_for(&mock, "weather")]);

    let request =
        Request::builder().method("GET").uri("/api/discovery").body(Body::empty()).unwrap();
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["serverInfo"]["name"], "mcp-gateway");
    assert_eq!(body["servers"][0]["name"], "weather");
    assert_eq!(body["servers"][0]["tools"][0]["name"], "get_weather");
}

#[tokio::test]
async fn test_tool_call_error_reply_not_postprocessed() {
    let mock = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"capabilities": {}, "serverInfo": {"name": "flaky", "version": "0"}}
        })))
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 2,
            "result": {"tools": [{"name": "boom", "inputSchema": {"type": "object"}}]}
        })))
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 3,
            "error": {"code": -32000, "message": "tool exploded"}
        })))
        .mount(&mock)
        .await;

    let router = gateway_router(vec![backend_for(&mock, "flaky")]);

    let (status, body) = send(&router, post("/boom", &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(body["error"]["message"], "tool exploded");
}
