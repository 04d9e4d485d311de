//! Operator endpoints for the dead-letter queue and event inspection.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use hookline_core::{DeadLetterEntry, DeadLetterId, DeliveryAttempt, Event, EventId};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResponse, Result},
    handlers::ingest::parse_destination,
    AppState,
};

/// Page size when `limit` is not given.
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Largest accepted `limit`.
pub const MAX_PAGE_SIZE: i64 = 500;

/// Pagination parameters for `GET /admin/events`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Page size, capped at [`MAX_PAGE_SIZE`].
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: Option<i64>,
}

/// Optional body of `POST /admin/dlq/{id}/retry`.
#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    /// Deliver here instead of the original destination.
    pub destination_url: Option<String>,
}

/// One page of events, newest first.
#[derive(Debug, Serialize)]
pub struct EventPage {
    /// Events on this page
    pub events: Vec<Event>,
    /// Effective page size
    pub limit: i64,
    /// Rows skipped
    pub offset: i64,
}

/// An event with everything recorded about its delivery.
#[derive(Debug, Serialize)]
pub struct EventDetail {
    /// The event
    pub event: Event,
    /// Its dead-letter entry, if it failed
    pub dead_letter: Option<DeadLetterEntry>,
    /// Every attempt, in order
    pub attempts: Vec<DeliveryAttempt>,
}

/// Lists PENDING dead-letter entries, oldest first.
#[instrument(name = "list_dead_letters", skip(state))]
pub async fn list_dead_letters(State(state): State<AppState>) -> Result<Response> {
    let entries = state.dead_letters.pending().await?;
    Ok(ApiResponse::ok(entries).into_response())
}

/// Marks an entry RESOLVED.
#[instrument(name = "resolve_dead_letter", skip(state))]
pub async fn resolve_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let entry = state.dead_letters.resolve(parse_id(&id)?).await?;
    Ok(ApiResponse::ok(entry).into_response())
}

/// Marks an entry ABANDONED.
#[instrument(name = "abandon_dead_letter", skip(state))]
pub async fn abandon_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let entry = state.dead_letters.abandon(parse_id(&id)?).await?;
    Ok(ApiResponse::ok(entry).into_response())
}

/// Re-delivers a PENDING entry once.
///
/// The body may name a different `destination_url`; an empty body uses the
/// original event's destination. A failed attempt is still a 200 with
/// `success: false` in the retry result.
#[instrument(name = "retry_dead_letter", skip(state, body))]
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let id: DeadLetterId = parse_id(&id)?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RetryRequest::default()
    } else {
        serde_json::from_slice::<RetryRequest>(&body)
            .map_err(|e| ApiError::InvalidJson { message: e.to_string() })?
    };
    let destination = request.destination_url.as_deref().map(parse_destination).transpose()?;

    let outcome = state.dead_letters.retry(id, destination).await?;
    info!(
        dead_letter_id = %id,
        success = outcome.success,
        status = %outcome.entry.status,
        "manual retry finished"
    );

    Ok(ApiResponse::ok(outcome).into_response())
}

/// Lists events newest first.
#[instrument(name = "list_events", skip(state, params))]
pub async fn list_events(
    State(state): State<AppState>,
    params: std::result::Result<Query<ListParams>, QueryRejection>,
) -> Result<Response> {
    let Query(params) = params.map_err(|e| ApiError::validation(e.body_text()))?;
    let (limit, offset) = page_bounds(&params)?;

    let events = state.storage.events.list(limit, offset).await?;
    Ok(ApiResponse::ok(EventPage { events, limit, offset }).into_response())
}

/// Loads an event with its dead-letter entry and delivery attempts.
#[instrument(name = "get_event", skip(state))]
pub async fn get_event(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let id: EventId = parse_id(&id)?;

    let event = state
        .storage
        .events
        .find_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("event {id} not found")))?;
    let dead_letter = state.dead_letters.for_event(id).await?;
    let attempts = state.storage.delivery_attempts.list_for_event(id).await?;

    Ok(ApiResponse::ok(EventDetail { event, dead_letter, attempts }).into_response())
}

fn parse_id<T: From<Uuid>>(raw: &str) -> Result<T> {
    Uuid::parse_str(raw)
        .map(T::from)
        .map_err(|_| ApiError::validation(format!("invalid id: {raw}")))
}

fn page_bounds(params: &ListParams) -> Result<(i64, i64)> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0);

    if limit < 1 {
        return Err(ApiError::validation("limit must be at least 1"));
    }
    if offset < 0 {
        return Err(ApiError::validation("offset must not be negative"));
    }

    Ok((limit.min(MAX_PAGE_SIZE), offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_default_and_cap() {
        assert_eq!(page_bounds(&ListParams::default()).unwrap(), (50, 0));
        assert_eq!(
            page_bounds(&ListParams { limit: Some(10_000), offset: Some(20) }).unwrap(),
            (500, 20)
        );
        assert!(page_bounds(&ListParams { limit: Some(0), offset: None }).is_err());
        assert!(page_bounds(&ListParams { limit: None, offset: Some(-1) }).is_err());
    }

    #[test]
    fn ids_must_be_uuids() {
        let id = Uuid::new_v4();
        let parsed: EventId = parse_id(&id.to_string()).unwrap();
        assert_eq!(parsed.0, id);

        let err = parse_id::<EventId>("evt_123").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
