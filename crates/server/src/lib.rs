//! Per-process ops endpoint: health probe and prometheus metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// HTTP server exposing /health and /metrics for one service process.
pub struct OpsServer {
    port: u16,
    registry: Arc<Registry>,
}

impl OpsServer {
    pub fn new(port: u16, registry: Arc<Registry>) -> Self {
        Self { port, registry }
    }

    /// Starts the server and blocks until the shutdown signal fires.
    pub async fn start(&self, shutdown: Arc<Notify>) -> Result<()> {
        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .with_state(self.registry.clone());

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("ops server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
            .context("Server error")?;

        info!("ops server shut down gracefully");
        Ok(())
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_metrics(State(registry): State<Arc<Registry>>) -> Response {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match String::from_utf8(buffer) {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to convert metrics to UTF-8: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
        }
    }
}
