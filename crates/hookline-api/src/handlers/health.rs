//! Health check handlers for service monitoring.
//!
//! Provides readiness, database connectivity and liveness endpoints for
//! load balancers and orchestration systems.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// `GET /health/ready` body.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Always `ok` while the process serves requests
    pub status: &'static str,
    /// Human-readable status line
    pub message: &'static str,
    /// Seconds since the server state was built
    pub uptime_seconds: u64,
}

/// Database connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbConnection {
    /// The probe query succeeded.
    Connected,
    /// The probe query failed.
    Disconnected,
}

/// `GET /health/db-connection` body.
#[derive(Debug, Serialize)]
pub struct DbConnectionResponse {
    /// Whether the service can take traffic
    pub ready: bool,
    /// Database connectivity
    pub db_connection: DbConnection,
}

/// Readiness probe with uptime.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ReadyResponse {
        status: "ok",
        message: "hookline is running",
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Runs a lightweight query against storage.
///
/// Returns 503 when the database does not answer.
#[instrument(name = "db_connection_check", skip(state))]
pub async fn db_connection_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(()) => {
            debug!("Database health check passed");
            (
                StatusCode::OK,
                Json(DbConnectionResponse { ready: true, db_connection: DbConnection::Connected }),
            )
        },
        Err(e) => {
            error!("Database health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(DbConnectionResponse {
                    ready: false,
                    db_connection: DbConnection::Disconnected,
                }),
            )
        },
    }
}

/// Liveness probe.
///
/// Always succeeds while the process is running. Checks no dependencies.
#[instrument(name = "liveness_check")]
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}
