//! Prometheus `/metrics` endpoint.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use finops_metrics::{MetricsCollector, render_prometheus};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub fn router(metrics: Arc<MetricsCollector>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(metrics)
}

/// GET /metrics
async fn prometheus_metrics(State(metrics): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    let body = render_prometheus(&metrics.snapshot().await);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Serve the endpoint on an already bound listener until shutdown.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<MetricsCollector>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics endpoint listening");
    }
    let server = axum::serve(listener, router(metrics)).with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(e) = server.await {
        error!(error = %e, "metrics endpoint failed");
    }
}
