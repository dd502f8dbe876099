//! Exec-stdio connector tests using shell one-liners as backends.

use serde_json::json;

use mcp_gateway::transport::exec;
use mcp_gateway::{BackendConfig, TransportError, TransportKind};

fn exec_backend(command: &str, args: &[&str]) -> BackendConfig {
    let mut backend = BackendConfig::new("shelly", TransportKind::StdioExec, 0);
    backend.command = Some(command.to_string());
    backend.args = args.iter().map(ToString::to_string).collect();
    backend
}

#[tokio::test]
async fn test_exec_call_parses_first_json_object() {
    let backend = exec_backend(
        "sh",
        &[
            "-c",
            r#"read line; echo 'starting up'; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#,
        ],
    );

    let request = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
    let reply = exec::call(&backend, &request).await.unwrap();
    assert_eq!(reply["result"]["ok"], true);
}

#[tokio::test]
async fn test_exec_missing_command_is_spawn_error() {
    let backend = BackendConfig::new("empty", TransportKind::StdioExec, 0);
    let err = exec::call(&backend, &json!({"method": "ping"})).await.unwrap_err();
    assert!(matches!(err, TransportError::Spawn(_)));
    assert_eq!(err.rpc_code(), -32003);
}

#[tokio::test]
async fn test_exec_nonexistent_binary_is_spawn_error() {
    let backend = exec_backend("definitely-not-a-real-binary-xyz", &[]);
    let err = exec::call(&backend, &json!({"method": "ping"})).await.unwrap_err();
    assert!(matches!(err, TransportError::Spawn(_)));
}

#[tokio::test]
async fn test_exec_empty_output_maps_to_proxy_error() {
    let backend = exec_backend("sh", &["-c", "read line; true"]);
    let err = exec::call(&backend, &json!({"method": "ping"})).await.unwrap_err();
    assert!(matches!(err, TransportError::EmptyOutput));
    assert_eq!(err.rpc_code(), -32003);
}

#[tokio::test]
async fn test_exec_malformed_output_is_parse_error() {
    let backend = exec_backend("sh", &["-c", r#"read line; echo '{"unterminated'"#]);
    let err = exec::call(&backend, &json!({"method": "ping"})).await.unwrap_err();
    // An unterminated object never closes its braces, so nothing extracts.
    assert!(matches!(err, TransportError::EmptyOutput | TransportError::Parse(_)));
}
