//! Cadence API server with graceful shutdown

use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::routes::api_router;
use crate::state::AppState;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server address
    pub addr: SocketAddr,
    /// Request timeout
    pub timeout: Duration,
    /// Max request body size (bytes)
    pub max_body_size: usize,
    /// SQLite database URL
    pub database_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024, // 1MB
            database_url: "sqlite:cadence.db?mode=rwc".to_string(),
        }
    }
}

impl ServerConfig {
    /// Create from environment variables
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("CADENCE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let timeout_secs: u64 = std::env::var("CADENCE_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(30);

        let defaults = Self::default();
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            timeout: Duration::from_secs(timeout_secs),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            ..defaults
        }
    }
}

/// Cadence API server
pub struct CadenceServer {
    config: ServerConfig,
    app_state: AppState,
}

impl CadenceServer {
    pub fn new(config: ServerConfig, app_state: AppState) -> Self {
        Self { config, app_state }
    }

    /// Router with middleware applied
    pub fn router(&self) -> Router {
        api_router(self.app_state.clone())
            .layer(RequestBodyLimitLayer::new(self.config.max_body_size))
            .layer(TimeoutLayer::new(self.config.timeout))
            .layer(TraceLayer::new_for_http())
    }

    /// Start the workers, serve until a shutdown signal, then drain the
    /// workers within their grace period.
    pub async fn run(self) -> Result<(), ApiError> {
        let app = self.router();
        let addr = self.config.addr;
        let orchestrator = self.app_state.orchestrator();

        orchestrator.start().await;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Cadence API listening");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ApiError::Internal(format!("Server error: {}", e)));

        orchestrator.stop().await;
        served?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Initialize tracing subscriber
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,cadence_queue=debug,cadence_api=debug,tower_http=debug")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
