use std::net::SocketAddr;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{HealthRegistry, HealthReport};

/// The liveness endpoint.
pub const LIVENESS_PATH: &str = "/health/ready";

/// The readiness endpoint.
pub const READINESS_PATH: &str = "/admin/synced/ready";

#[derive(Debug, Clone)]
struct HealthState {
    liveness: HealthRegistry,
    readiness: HealthRegistry,
}

/// Build the router serving the cached results of both registries.
pub fn router(liveness: HealthRegistry, readiness: HealthRegistry) -> Router {
    Router::new()
        .route(LIVENESS_PATH, get(handle_liveness))
        .route(READINESS_PATH, get(handle_readiness))
        .with_state(HealthState { liveness, readiness })
}

fn respond(report: HealthReport) -> (StatusCode, Json<HealthReport>) {
    let status =
        if report.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

async fn handle_liveness(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    respond(state.liveness.report())
}

async fn handle_readiness(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    respond(state.readiness.report())
}

/// Serve `router` on `addr` until cancellation.
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "🩺 Health server listening");

    axum::serve(listener, router).with_graceful_shutdown(cancel.cancelled_owned()).await
}
