//! HTTP exposition of the metrics registry.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;

use super::prometheus::metrics_handler;

/// Router serving `GET /metrics`.
pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves `/metrics` on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Serving metrics");

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await
}
