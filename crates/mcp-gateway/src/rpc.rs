//! JSON-RPC 2.0 envelopes and helpers.
//!
//! The gateway forwards loosely-typed envelopes: `params` and `result` stay
//! opaque `serde_json::Value`s, and backend payloads are never re-validated
//! against a schema.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// JSON-RPC error codes used on the client wire.
pub mod code {
    /// Malformed JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// Not a valid JSON-RPC request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method does not exist.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Generic server error (also: exec-stdio deadline).
    pub const SERVER_ERROR: i32 = -32000;
    /// Backend unreachable (connection refused, unknown host).
    pub const UNREACHABLE: i32 = -32001;
    /// No backend with that name.
    pub const NO_SERVER: i32 = -32002;
    /// Proxy forwarding error.
    pub const PROXY_ERROR: i32 = -32003;
}

/// MCP protocol version spoken on streamable-HTTP backends.
pub const PROTOCOL_VERSION_HTTP: &str = "2025-03-26";

/// MCP protocol version spoken on SSE backends.
pub const PROTOCOL_VERSION_SSE: &str = "2024-11-05";

/// JSON-RPC 2.0 request. The version field is tolerated missing; several MCP
/// clients omit it on notification-style calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

fn default_version() -> String {
    "2.0".to_string()
}

impl JsonRpcRequest {
    /// A request without an `id` is a notification and gets no reply.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// JSON-RPC version constant.
    const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: Cow::Borrowed(Self::VERSION), result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
        }
    }
}

/// Build a request envelope as a raw `Value`.
#[must_use]
pub fn request(id: Value, method: &str, params: Value) -> Value {
    let mut req = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if !params.is_null() {
        req["params"] = params;
    }
    req
}

/// Build a notification envelope (no `id`, no reply expected).
#[must_use]
pub fn notification(method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
    })
}

/// Uniform stringification of a JSON-RPC `id` for reply correlation.
///
/// SSE backends may echo a numeric id back as a string (or vice versa), so
/// both sides of the pending map use this coercion. Documented behavior:
/// strings map to their content, everything else to its JSON rendering.
#[must_use]
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `true` when a decoded line/frame is a reply rather than an echo of our own
/// request or a server-initiated call.
#[must_use]
pub fn is_reply(value: &Value) -> bool {
    value.get("method").is_none()
        && (value.get("result").is_some() || value.get("error").is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parse() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert!(!req.is_notification());
        assert_eq!(req.id, Some(json!(1)));
    }

    #[test]
    fn test_request_without_version_field() {
        // Several MCP clients omit "jsonrpc"; the envelope still parses.
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"id":"abc","method":"tools/list"}"#).unwrap();
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.method, "tools/list");
    }

    #[test]
    fn test_notification_has_no_id() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn test_response_shape() {
        let ok = JsonRpcResponse::success(Some(json!(1)), json!({"tools": []}));
        let raw = serde_json::to_value(&ok).unwrap();
        assert_eq!(raw["jsonrpc"], "2.0");
        assert!(raw.get("error").is_none());

        let err = JsonRpcResponse::error(Some(json!("abc")), code::NO_SERVER, "no such server");
        let raw = serde_json::to_value(&err).unwrap();
        assert_eq!(raw["error"]["code"], code::NO_SERVER);
        assert!(raw.get("result").is_none());
    }

    #[test]
    fn test_id_key_coercion() {
        assert_eq!(id_key(&json!(7)), "7");
        assert_eq!(id_key(&json!("7")), "7");
        assert_eq!(id_key(&json!("abc")), "abc");
        assert_eq!(id_key(&Value::Null), "null");
    }

    #[test]
    fn test_is_reply_filters_echoes() {
        assert!(is_reply(&json!({"jsonrpc":"2.0","id":1,"result":{}})));
        assert!(is_reply(&json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"x"}})));
        // Echo of an outgoing request
        assert!(!is_reply(&json!({"jsonrpc":"2.0","id":1,"method":"initialize"})));
        // Server-initiated notification
        assert!(!is_reply(&json!({"jsonrpc":"2.0","method":"notifications/progress"})));
    }

    #[test]
    fn test_request_builder_omits_null_params() {
        let req = request(json!(1), "ping", Value::Null);
        assert!(req.get("params").is_none());
        let req = request(json!(1), "tools/call", json!({"name": "t"}));
        assert_eq!(req["params"]["name"], "t");
    }
}
