//! Gateway server: wiring, lifecycle, and graceful shutdown.

pub mod api;
pub mod auth;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::{GatewayConfig, timeouts};
use crate::forwarder::{Forwarder, GatewayStandardHandler, StandardHandler};
use crate::openapi::OpenApiBuilder;
use crate::registry::ConnectionRegistry;
use crate::toolcache::ToolCache;

use self::auth::{AllowAll, ApiKeyValidator, BearerValidator};

/// Shared state behind every handler.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub tools: Arc<ToolCache>,
    pub forwarder: Arc<Forwarder>,
    pub openapi: Arc<OpenApiBuilder>,
    pub validator: Arc<dyn BearerValidator>,
    pub started_at: Instant,
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("backends", &self.config.backends.len()).finish()
    }
}

/// The reverse-proxy gateway.
pub struct GatewayServer {
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Wire up the gateway from config with the default standard handler.
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        Self::with_standard_handler(config, Arc::new(GatewayStandardHandler))
    }

    /// Wire up the gateway with a custom proxy-capabilities advertisement.
    pub fn with_standard_handler(
        config: GatewayConfig,
        standard: Arc<dyn StandardHandler>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let config = Arc::new(config);

        let registry = Arc::new(ConnectionRegistry::new(cancel.clone())?);
        let tools = Arc::new(ToolCache::new(Arc::clone(&config), Arc::clone(&registry)));
        let forwarder =
            Arc::new(Forwarder::new(Arc::clone(&config), Arc::clone(&registry), standard));
        let openapi = Arc::new(OpenApiBuilder::new(Arc::clone(&tools)));

        let validator: Arc<dyn BearerValidator> = match &config.api_key {
            Some(key) => Arc::new(ApiKeyValidator::new(key.clone())),
            None => Arc::new(AllowAll),
        };

        let state = Arc::new(AppState {
            config,
            registry,
            tools,
            forwarder,
            openapi,
            validator,
            started_at: Instant::now(),
            started_at_utc: chrono::Utc::now(),
        });

        Ok(Self { state, cancel })
    }

    /// The client-facing router (also used directly by integration tests).
    #[must_use]
    pub fn router(&self) -> axum::Router {
        router::build_router(Arc::clone(&self.state))
    }

    /// Shared application state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Root cancellation token; cancelling it begins shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until ctrl-c or cancellation, then drain with a bounded grace.
    pub async fn run(self) -> anyhow::Result<()> {
        let port = self.state.config.port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        self.state.registry.start_maintenance();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(
            backends = self.state.config.backends.len(),
            "gateway listening on http://{addr}"
        );

        let router = self.router();
        let cancel = self.cancel.clone();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

        // Signal every connector and drain within the grace period.
        self.cancel.cancel();
        let drained = tokio::time::timeout(timeouts::SHUTDOWN_GRACE, async {
            self.state.registry.close_all().await
        })
        .await;
        match drained {
            Ok(closed) => tracing::info!(closed, "gateway shut down"),
            Err(_) => tracing::warn!("shutdown grace period expired with connections open"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer").finish()
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to install CTRL+C handler");
            }
            tracing::info!("received shutdown signal");
        }
        () = cancel.cancelled() => {
            tracing::info!("cancellation requested");
        }
    }
}
