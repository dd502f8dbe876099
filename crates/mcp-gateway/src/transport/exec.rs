//! Exec-stdio connector: one spawned process per call.
//!
//! Used for backends that declare stdio transport without a TCP hoster. The
//! request is written to the child's stdin with a trailing newline, stdout is
//! captured until exit, and the first JSON object found is the reply. There
//! is no persistent session and no session-id relay.

use std::process::Stdio;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{BackendConfig, timeouts};
use crate::error::{TransportError, TransportResult};

/// Run one JSON-RPC exchange against an exec-stdio backend.
pub async fn call(backend: &BackendConfig, request: &Value) -> TransportResult<Value> {
    let command = backend
        .command
        .as_deref()
        .ok_or_else(|| TransportError::Spawn(format!("backend {} has no command", backend.name)))?;

    let mut cmd = Command::new(command);
    cmd.args(&backend.args)
        .envs(&backend.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        // Dropping the wait future on timeout must reap the child.
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| TransportError::Spawn(format!("{command}: {e}")))?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Spawn("child stdin unavailable".to_string()))?;

    let output = tokio::time::timeout(timeouts::EXEC_TOTAL, async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);
        child.wait_with_output().await
    })
    .await
    .map_err(|_| TransportError::ProcessTimeout(timeouts::EXEC_TOTAL))??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let raw = extract_json(&stdout).ok_or(TransportError::EmptyOutput)?;
    Ok(serde_json::from_str(raw)?)
}

/// Find the first complete JSON object in mixed process output.
///
/// Backends routinely interleave banners or log lines with the reply, so the
/// scan brace-matches from the first `{`, respecting strings and escapes.
#[must_use]
pub fn extract_json(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let bytes = output.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&output[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
