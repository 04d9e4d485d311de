//! Prometheus scrape endpoint.

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use hookline_core::metrics::CONTENT_TYPE;
use tracing::instrument;

use crate::AppState;

/// Every counter and histogram in the Prometheus text format.
#[instrument(name = "metrics_exposition", skip(state))]
pub async fn metrics_exposition(State(state): State<AppState>) -> Response {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], state.metrics.render()).into_response()
}
