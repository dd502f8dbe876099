//! Post-processing of MCP `tools/call` results for the direct-call facade.
//!
//! The facade returns plain values instead of MCP content envelopes: text
//! items that parse as JSON become their parsed value, image items become
//! data URLs, and a single-element content list is unwrapped.

use serde_json::Value;

/// Flatten an MCP tool result into the direct-call response shape.
#[must_use]
pub fn postprocess_tool_result(result: &Value) -> Value {
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return result.clone();
    };

    let mut processed: Vec<Value> = content.iter().map(process_item).collect();
    if processed.len() == 1 {
        processed.remove(0)
    } else {
        Value::Array(processed)
    }
}

fn process_item(item: &Value) -> Value {
    match item.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        Some("image") => {
            let mime = item.get("mimeType").and_then(Value::as_str);
            let data = item.get("data").and_then(Value::as_str);
            match (mime, data) {
                (Some(mime), Some(data)) => Value::String(format!("data:{mime};base64,{data}")),
                _ => item.clone(),
            }
        }
        _ => item.clone(),
    }
}
