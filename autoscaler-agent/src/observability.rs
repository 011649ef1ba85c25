//! Administrative HTTP server: `/health` and a Prometheus-compatible
//! `/metrics` endpoint backed by the `metrics` facade (§7: `scale.invoke
//! .success_count`, `scale.invoke.error_count`, `scale.evaluate_ms`,
//! `scale.invoke_ms`, `plugin.*.invoke_ms`).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct ServerState {
    prometheus: PrometheusHandle,
    started_at: std::time::Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn metrics(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.prometheus.render()
}

/// Installs the process-wide Prometheus recorder and returns a router
/// exposing `/health` and `/metrics`.
pub fn router() -> Router {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the prometheus recorder");

    let state = Arc::new(ServerState {
        prometheus,
        started_at: std::time::Instant::now(),
    });

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(host: &str, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "observability server listening");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
