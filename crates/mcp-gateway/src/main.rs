//! MCP Gateway - Entry Point

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_gateway::{GatewayConfig, GatewayServer};

#[derive(Parser, Debug)]
#[command(name = "mcp-gateway")]
#[command(about = "Reverse-proxy gateway for MCP backend fleets")]
#[command(version)]
struct Cli {
    /// Path to the backend descriptor file (JSON)
    #[arg(long, default_value = "gateway.json", env = "MCP_GATEWAY_CONFIG")]
    config: String,

    /// Client-facing listen port (overrides the config file)
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// API key; when set, clients must send `Authorization: Bearer <key>`
    #[arg(long, env = "MCP_API_KEY")]
    api_key: Option<String>,

    /// Disable the aggregator /api endpoints
    #[arg(long)]
    no_api: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = GatewayConfig::from_file(&cli.config)?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.api_key.is_some() {
        config.api_key = cli.api_key;
    }
    if cli.no_api {
        config.enable_api = false;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backends = config.backends.len(),
        port = config.port,
        "starting MCP gateway"
    );

    GatewayServer::new(config)?.run().await
}
