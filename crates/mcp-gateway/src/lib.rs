//! MCP Gateway
//!
//! A reverse-proxy gateway that fronts a fleet of Model Context Protocol
//! backends with heterogeneous transports and presents them as one uniform
//! JSON-RPC 2.0 endpoint per backend, plus aggregated discovery, OpenAPI,
//! and direct-tool-call facades.
//!
//! # Features
//!
//! - **Four transports**: streamable HTTP, SSE with a learned session
//!   endpoint, line-delimited JSON-RPC over TCP, and per-call exec-stdio
//! - **Session relay**: `Mcp-Session-Id` travels transparently in both
//!   directions, with at most one initialized session per backend
//! - **Tool routing**: periodic `tools/list` discovery feeds a reverse index
//!   that drives anonymous `POST /<tool>` calls and OpenAPI assembly
//! - **Async-first**: built on Tokio with per-method deadline budgets and a
//!   root cancellation token
//!
//! # Example
//!
//! ```no_run
//! use mcp_gateway::{GatewayConfig, GatewayServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::from_file("gateway.json")?;
//!     GatewayServer::new(config)?.run().await
//! }
//! ```

pub mod config;
pub mod content;
pub mod error;
pub mod forwarder;
pub mod openapi;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod toolcache;
pub mod transport;

pub use config::{BackendConfig, GatewayConfig, TransportKind};
pub use error::{GatewayError, TransportError};
pub use server::GatewayServer;
