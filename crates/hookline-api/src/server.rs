//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Server fault redaction (production only)
//! 5. HTTP metrics
//! 6. Handler execution
//!
//! # Graceful Shutdown
//!
//! The server stops accepting connections when the shutdown future resolves
//! and waits for in-flight requests to finish.

use std::{future::Future, net::SocketAddr};

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::Environment,
    error::{ApiResponse, ErrorBody, ServerFault, REDACTED_MESSAGE},
    handlers, AppState,
};

/// Header carrying the per-request id.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Creates the router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use hookline_api::{create_router, AppState};
///
/// fn build(state: AppState) {
///     let app = create_router(state);
///     // Serve the app...
/// }
/// ```
pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new().route("/webhooks", post(handlers::ingest_webhook));

    let admin_routes = Router::new()
        .route("/admin/dlq", get(handlers::list_dead_letters))
        .route("/admin/dlq/{id}/resolve", post(handlers::resolve_dead_letter))
        .route("/admin/dlq/{id}/abandon", post(handlers::abandon_dead_letter))
        .route("/admin/dlq/{id}/retry", post(handlers::retry_dead_letter))
        .route("/admin/events", get(handlers::list_events))
        .route("/admin/events/{id}", get(handlers::get_event));

    let operational_routes = Router::new()
        .route("/health/ready", get(handlers::readiness_check))
        .route("/health/db-connection", get(handlers::db_connection_check))
        .route("/health/live", get(handlers::liveness_check))
        .route("/metrics", get(handlers::metrics_exposition));

    Router::new()
        .merge(webhook_routes)
        .merge(admin_routes)
        .merge(operational_routes)
        .layer(middleware::from_fn_with_state(state.clone(), record_http_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), redact_server_faults))
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds `X-Request-Id` to every response.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Counts requests and latency by method, matched route and status.
async fn record_http_metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());
    let started = state.clock.now();

    let response = next.run(req).await;

    let elapsed = state.clock.now().saturating_duration_since(started);
    state.metrics.record_http_request(&method, &route, response.status().as_u16(), elapsed);
    response
}

/// Replaces server fault messages with a generic one in production.
async fn redact_server_faults(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let response = next.run(req).await;

    if state.config.environment != Environment::Production {
        return response;
    }
    let Some(fault) = response.extensions().get::<ServerFault>().copied() else {
        return response;
    };

    let status = response.status();
    let body = ApiResponse::failure(ErrorBody {
        code: fault.code,
        message: REDACTED_MESSAGE.to_string(),
        details: None,
    });
    (status, body).into_response()
}

/// Serves the router until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or the server
/// fails.
///
/// # Example
///
/// ```no_run
/// use hookline_api::{server::shutdown_signal, start_server, AppState};
///
/// async fn run(state: AppState) -> std::io::Result<()> {
///     let addr = "127.0.0.1:3000".parse().expect("valid address");
///     start_server(state, addr, shutdown_signal()).await
/// }
/// ```
pub async fn start_server<F>(state: AppState, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("HTTP server listening on {}", actual_addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
