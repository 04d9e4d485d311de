//! Audit trail of outbound delivery attempts.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::{
    models::{DeliveryAttempt, NewDeliveryAttempt},
    storage::DeliveryAttemptStore,
    Clock, EventId,
};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// Longest response body kept in the audit trail, in characters.
pub const MAX_LOGGED_BODY_CHARS: usize = 1000;

/// What was sent.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    /// Event being delivered.
    pub event_id: EventId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Destination URL.
    pub destination_url: String,
    /// Headers sent.
    pub headers: HashMap<String, String>,
    /// Body sent.
    pub body: Value,
    /// When the call started.
    pub started_at: DateTime<Utc>,
}

/// What came back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// The destination answered.
    Response {
        /// HTTP status code.
        status_code: u16,
        /// Raw response body.
        body: String,
    },
    /// No response arrived.
    TransportError {
        /// Error text.
        message: String,
    },
}

/// Appends [`DeliveryAttempt`] records stamped with completion time and
/// latency.
#[derive(Clone)]
pub struct AttemptLogger {
    store: Arc<dyn DeliveryAttemptStore>,
    clock: Arc<dyn Clock>,
}

impl AttemptLogger {
    /// Creates a logger writing to `store`.
    pub fn new(store: Arc<dyn DeliveryAttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records one attempt. The response body is cut to
    /// [`MAX_LOGGED_BODY_CHARS`] characters.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the record cannot be written.
    pub async fn log(
        &self,
        request: AttemptRequest,
        result: AttemptResult,
    ) -> Result<DeliveryAttempt> {
        let completed_at = self.clock.now_utc();
        let latency_ms = (completed_at - request.started_at).num_milliseconds().max(0);

        let (status_code, response_body, error_message, success) = match result {
            AttemptResult::Response { status_code, body } => (
                Some(i32::from(status_code)),
                Some(truncate_chars(&body, MAX_LOGGED_BODY_CHARS)),
                None,
                (200..300).contains(&status_code),
            ),
            AttemptResult::TransportError { message } => (None, None, Some(message), false),
        };

        let attempt = self
            .store
            .record(NewDeliveryAttempt {
                event_id: request.event_id,
                attempt_number: i32::try_from(request.attempt_number).unwrap_or(i32::MAX),
                destination_url: request.destination_url,
                request_headers: request.headers,
                request_body: request.body,
                status_code,
                response_body,
                error_message,
                started_at: request.started_at,
                completed_at,
                latency_ms,
                success,
            })
            .await?;

        debug!(
            event_id = %attempt.event_id,
            attempt = attempt.attempt_number,
            success = attempt.success,
            latency_ms = attempt.latency_ms,
            "delivery attempt recorded"
        );
        Ok(attempt)
    }

    /// Attempts for an event in attempt order.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` on read failure.
    pub async fn attempts_for(&self, event_id: EventId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.store.list_for_event(event_id).await?)
    }
}

impl std::fmt::Debug for AttemptLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptLogger").finish_non_exhaustive()
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
