//! Health and metrics HTTP endpoints

use crate::metrics;
use crate::server::Server;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build the observability router
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .with_state(server)
}

/// Serve the router until the shutdown token fires
pub async fn serve(
    address: &str,
    server: Arc<Server>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %address, "http api listening");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn root() -> &'static str {
    concat!("gatewayd ", env!("CARGO_PKG_VERSION"))
}

async fn health(State(server): State<Arc<Server>>) -> impl IntoResponse {
    Json(json!({
        "status": server.status().to_string(),
        "connections": server.connections(),
    }))
}

async fn ready(State(server): State<Arc<Server>>) -> StatusCode {
    if server.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn prometheus_metrics() -> String {
    metrics::encode_metrics()
}
