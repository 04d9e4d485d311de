//! Webhook ingestion handler with validation and persistence.
//!
//! Authenticates the raw body, validates the delivery headers, arbitrates
//! the idempotency key and persists the wrapped event for the dispatchers.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use hookline_core::{
    models::NewEvent, Acquisition, EventEnvelope, EventId, EventStatus, KeyOutcome,
    StoredResponse,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    crypto::{self, SIGNATURE_HEADER},
    error::{ApiError, ApiResponse, ErrorKind, Result},
    AppState,
};

/// Header naming the idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Header naming where the event is delivered.
pub const DESTINATION_HEADER: &str = "X-Destination-URL";

/// Response from successful webhook ingestion.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Identifier of the stored event
    pub event_id: EventId,
    /// Current processing status of the event
    pub status: EventStatus,
}

enum Ingested {
    Accepted(IngestResponse),
    Replayed(StoredResponse),
}

/// Accepts a signed webhook for delivery.
///
/// # Errors
///
/// Returns:
/// - 400: missing or malformed headers, invalid JSON, or a key reused with a
///   different body
/// - 403: signature mismatch
/// - 409: the key is held by a request still in flight
/// - 500: storage failure
///
/// A key that already finished replays its stored status and body.
#[instrument(
    name = "ingest_webhook",
    skip(state, headers, body),
    fields(
        content_length = body.len(),
        idempotency_key = headers.get(IDEMPOTENCY_KEY_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("none"),
    )
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = ingest(&state, &headers, &body).await;
    state.metrics.record_event_received(outcome_label(&result));

    match result {
        Ok(Ingested::Accepted(accepted)) => {
            (StatusCode::ACCEPTED, ApiResponse::ok(accepted)).into_response()
        },
        Ok(Ingested::Replayed(stored)) => {
            let status =
                StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(stored.body)).into_response()
        },
        Err(e) => e.into_response(),
    }
}

async fn ingest(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Ingested> {
    verify_signature(&state.config.webhook_secret, headers, body)?;

    let key = header_str(headers, IDEMPOTENCY_KEY_HEADER)
        .filter(|k| !k.is_empty())
        .ok_or(ApiError::MissingIdempotencyKey)?;

    let raw_destination = header_str(headers, DESTINATION_HEADER)
        .filter(|d| !d.is_empty())
        .ok_or(ApiError::MissingDestination)?;
    let destination_url = parse_destination(raw_destination)?;

    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidJson { message: e.to_string() })?;

    match state.idempotency.acquire(key, &payload).await? {
        Acquisition::Proceed => {
            let insert = state
                .storage
                .events
                .insert(NewEvent {
                    idempotency_key: key.to_string(),
                    destination_url,
                    payload: EventEnvelope::wrap(payload, state.clock.now_utc()),
                })
                .await?;

            let event = insert.event;
            if insert.created {
                info!(event_id = %event.id, "webhook accepted");
                return Ok(Ingested::Accepted(IngestResponse {
                    event_id: event.id,
                    status: event.status,
                }));
            }

            // The key was reclaimed after its previous owner stopped before
            // finalizing it. A finished event settles the key now.
            let outcome = match event.status {
                EventStatus::Delivered => KeyOutcome::Processed,
                EventStatus::Failed => KeyOutcome::Failed,
                EventStatus::Received | EventStatus::Processing => {
                    info!(
                        event_id = %event.id,
                        "reclaimed key already has an event, returning it"
                    );
                    return Ok(Ingested::Accepted(IngestResponse {
                        event_id: event.id,
                        status: event.status,
                    }));
                },
            };
            let stored = state.idempotency.complete(outcome, key).await?;
            info!(
                event_id = %event.id,
                status = %event.status,
                "reclaimed key belongs to a finished event, replaying its outcome"
            );
            Ok(Ingested::Replayed(stored))
        },
        Acquisition::ReturnCached(stored) | Acquisition::Failed(stored) => {
            debug!(status = stored.status, "replaying stored response");
            Ok(Ingested::Replayed(stored))
        },
        Acquisition::Conflict => Err(ApiError::IdempotencyConflict),
        Acquisition::HashMismatch => Err(ApiError::IdempotencyHashMismatch),
    }
}

fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let header = headers.get(SIGNATURE_HEADER).ok_or(ApiError::MissingSignature)?;
    let header = header.to_str().map_err(|_| ApiError::MalformedSignature)?;
    let signature = crypto::decode_signature(header)?;
    crypto::verify(secret.as_bytes(), body, &signature)?;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Accepts absolute http(s) URLs with a host.
pub(crate) fn parse_destination(raw: &str) -> Result<String> {
    let invalid = |reason: String| ApiError::InvalidDestination { url: raw.to_string(), reason };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https".to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("url must include a host".to_string()));
    }

    Ok(raw.to_string())
}

fn outcome_label(result: &Result<Ingested>) -> &'static str {
    match result {
        Ok(Ingested::Accepted(_)) => "accepted",
        Ok(Ingested::Replayed(_)) => "replayed",
        Err(e) => match e.kind() {
            ErrorKind::ClientInput => "invalid",
            ErrorKind::Integrity => "unauthorized",
            ErrorKind::IdempotencyConflict => "conflict",
            ErrorKind::NotFound
            | ErrorKind::InvalidState
            | ErrorKind::Persistence
            | ErrorKind::Invariant => "error",
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderName;

    use super::*;

    #[test]
    fn destinations_must_be_absolute_http() {
        assert!(parse_destination("https://example.com/hooks").is_ok());
        assert!(parse_destination("http://127.0.0.1:8080/x").is_ok());

        for raw in ["/relative", "ftp://example.com", "not a url", "mailto:ops@example.com"] {
            let err = parse_destination(raw).unwrap_err();
            assert_eq!(err.code(), "INVALID_DESTINATION", "accepted {raw}");
        }
    }

    #[test]
    fn signature_checks_run_before_anything_else() {
        let name = HeaderName::from_bytes(SIGNATURE_HEADER.as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        assert!(matches!(
            verify_signature("secret", &headers, b"{}"),
            Err(ApiError::MissingSignature)
        ));

        headers.insert(name.clone(), "zz".parse().unwrap());
        assert!(matches!(
            verify_signature("secret", &headers, b"{}"),
            Err(ApiError::MalformedSignature)
        ));

        headers.insert(name.clone(), "00ff".parse().unwrap());
        assert!(matches!(
            verify_signature("secret", &headers, b"{}"),
            Err(ApiError::SignatureMismatch)
        ));

        let valid = crypto::sign(b"secret", b"{}").unwrap();
        headers.insert(name.clone(), valid.parse().unwrap());
        assert!(verify_signature("secret", &headers, b"{}").is_ok());
    }
}
