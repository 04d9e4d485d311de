//! HTTP request handlers.
//!
//! Handlers are grouped by surface:
//! - `ingest` - signed webhook intake
//! - `admin` - dead-letter operations and event inspection
//! - `health` - readiness, database and liveness probes
//! - `metrics` - Prometheus text exposition
//!
//! Failures are returned as [`crate::error::ApiError`], which renders the
//! `{success, data, error}` envelope.

pub mod admin;
pub mod health;
pub mod ingest;
pub mod metrics;

pub use admin::{
    abandon_dead_letter, get_event, list_dead_letters, list_events, resolve_dead_letter,
    retry_dead_letter,
};
pub use health::{db_connection_check, liveness_check, readiness_check};
pub use ingest::ingest_webhook;
pub use metrics::metrics_exposition;
