//! Error types for the gateway.
//!
//! Uses `thiserror` for structured error handling. Connectors return
//! [`TransportError`] upward; the forwarder is the single point that turns
//! errors into JSON-RPC error objects on the client wire.

use std::time::Duration;

use crate::rpc;

/// Errors raised by the transport connectors.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Connection refused, host unknown, or any other connect-phase failure.
    #[error("Cannot connect to backend: {0}")]
    Connect(String),

    /// Operation exceeded its budget.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected HTTP status from the backend.
    #[error("Unexpected status {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body or message
        message: String,
    },

    /// HTTP transport error not covered by a more specific class.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed wire data (bad SSE frame, non-JSON line).
    #[error("Framing error: {0}")]
    Framing(String),

    /// The correlation channel closed before a reply arrived (teardown).
    #[error("Connection closed while awaiting reply")]
    ChannelClosed,

    /// exec-stdio process could not be spawned.
    #[error("Failed to spawn backend process: {0}")]
    Spawn(String),

    /// exec-stdio process exceeded its total budget.
    #[error("Backend process timed out after {0:?}")]
    ProcessTimeout(Duration),

    /// exec-stdio process produced no output.
    #[error("Backend process produced no output")]
    EmptyOutput,

    /// Reply was not valid JSON.
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Root cancellation fired.
    #[error("Operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Classify a reqwest error into connect/timeout/other.
    #[must_use]
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else {
            Self::Http(err)
        }
    }

    /// Connect-class errors (refused, unknown host) get the longest back-off.
    #[must_use]
    pub const fn is_connect_class(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Timeout-class errors.
    #[must_use]
    pub const fn is_timeout_class(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ProcessTimeout(_))
    }

    /// Whether retry policy applies. Protocol errors are authoritative and
    /// never retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.is_connect_class() || self.is_timeout_class()
    }

    /// The JSON-RPC error code this error surfaces as on the client wire.
    #[must_use]
    pub const fn rpc_code(&self) -> i32 {
        match self {
            Self::Connect(_) => rpc::code::UNREACHABLE,
            Self::ProcessTimeout(_) => rpc::code::SERVER_ERROR,
            Self::Parse(_) => rpc::code::PARSE_ERROR,
            _ => rpc::code::PROXY_ERROR,
        }
    }
}

/// Errors raised above the transport layer.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// The named backend is not configured.
    #[error("No such server: {0}")]
    UnknownBackend(String),

    /// The backend's transport tag has no connector.
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Client request body was not a JSON-RPC object.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transport failure, carried upward.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl GatewayError {
    /// The JSON-RPC error code this error surfaces as on the client wire.
    #[must_use]
    pub const fn rpc_code(&self) -> i32 {
        match self {
            Self::UnknownBackend(_) => rpc::code::NO_SERVER,
            Self::UnsupportedTransport(_) => rpc::code::INVALID_PARAMS,
            Self::InvalidRequest(_) => rpc::code::INVALID_REQUEST,
            Self::Transport(e) => e.rpc_code(),
        }
    }
}

/// Result type alias for connector operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
