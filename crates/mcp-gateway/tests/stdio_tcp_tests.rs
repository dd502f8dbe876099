//! STDIO-over-TCP connector tests against a line-delimited mock hoster.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

use mcp_gateway::transport::stdio_tcp::StdioTcpConnection;
use mcp_gateway::{BackendConfig, GatewayConfig, GatewayServer, TransportKind};

/// Mock hoster: one JSON-RPC object per line. Every incoming request line is
/// echoed back first (socat-style), then answered.
async fn spawn_stdio_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(handle_connection(stream));
        }
    });
    addr
}

async fn handle_connection(stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(request) = serde_json::from_str::<Value>(trimmed) else { continue };

        // Echo the raw request first; the connector must discard it.
        let echo = format!("{trimmed}\n");
        if write_half.write_all(echo.as_bytes()).await.is_err() {
            break;
        }

        let Some(reply) = reply_for(&request) else { continue };
        let framed = format!("{reply}\n");
        if write_half.write_all(framed.as_bytes()).await.is_err() {
            break;
        }
        let _ = write_half.flush().await;
    }
}

fn reply_for(request: &Value) -> Option<Value> {
    let method = request.get("method")?.as_str()?;
    let id = request.get("id")?.clone();

    let reply = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "stdio-mock", "version": "1.0"}
            }
        }),
        "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [{
                    "name": "fs_read",
                    "description": "Read a file",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"path": {"type": "string"}},
                        "required": ["path"]
                    }
                }]
            }
        }),
        "tools/call" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [{"type": "text", "text": "{\"bytes\":42}"}]}
        }),
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("Method not found: {method}")}
        }),
    };
    Some(reply)
}

fn backend_at(addr: SocketAddr, name: &str) -> BackendConfig {
    let mut backend = BackendConfig::new(name, TransportKind::StdioTcp, addr.port());
    backend.host = Some(addr.ip().to_string());
    backend
}

#[tokio::test]
async fn test_open_and_call_discards_echoes() {
    let addr = spawn_stdio_backend().await;
    let conn = StdioTcpConnection::open(&backend_at(addr, "fs")).await.unwrap();

    assert!(conn.is_initialized());
    assert_eq!(conn.server_info().await["name"], "stdio-mock");

    let reply = conn.call_method("ping", Value::Null).await.unwrap();
    assert_eq!(reply["result"], json!({}));
}

#[tokio::test]
async fn test_calls_are_serialized_fifo() {
    let addr = spawn_stdio_backend().await;
    let conn = Arc::new(StdioTcpConnection::open(&backend_at(addr, "fs")).await.unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let conn = Arc::clone(&conn);
        handles.push(tokio::spawn(async move { conn.call_method("ping", Value::Null).await }));
    }
    for handle in handles {
        let reply = handle.await.unwrap().unwrap();
        assert!(reply.get("result").is_some());
    }
    assert!(conn.is_healthy());
}

#[tokio::test]
async fn test_ephemeral_discovery() {
    let addr = spawn_stdio_backend().await;
    let reply = StdioTcpConnection::discover_tools(&backend_at(addr, "fs")).await.unwrap();
    assert_eq!(reply["result"]["tools"][0]["name"], "fs_read");
}

#[tokio::test]
async fn test_forward_through_router() {
    let addr = spawn_stdio_backend().await;
    let config = GatewayConfig::for_testing(vec![backend_at(addr, "fs")]);
    let router = GatewayServer::new(config).unwrap().router();

    let request = Request::builder()
        .method("POST")
        .uri("/fs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}).to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["id"], 7);
    assert_eq!(body["result"], json!({}));
}

#[tokio::test]
async fn test_direct_tool_call_over_stdio() {
    let addr = spawn_stdio_backend().await;
    let config = GatewayConfig::for_testing(vec![backend_at(addr, "fs")]);
    let router = GatewayServer::new(config).unwrap().router();

    // fs_read resolves through the cache (ephemeral discovery), then the
    // call itself rides the long-lived pool connection.
    let request = Request::builder()
        .method("POST")
        .uri("/fs_read")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"path": "/etc/hosts"}).to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({"bytes": 42}));
}

#[tokio::test]
async fn test_unreachable_hoster_fails_with_connect_error() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = StdioTcpConnection::discover_tools(&backend_at(addr, "gone")).await.unwrap_err();
    assert!(matches!(err, mcp_gateway::TransportError::Connect(_)));
}
