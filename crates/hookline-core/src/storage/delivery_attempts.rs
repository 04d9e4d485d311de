//! PostgreSQL delivery attempt audit trail.

use std::sync::Arc;

use sqlx::{types::Json, PgPool};

use super::{DeliveryAttemptStore, StoreFuture};
use crate::models::{DeliveryAttempt, DeliveryAttemptId, EventId, NewDeliveryAttempt};

/// Repository for the `delivery_attempts` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

impl DeliveryAttemptStore for Repository {
    fn record(&self, attempt: NewDeliveryAttempt) -> StoreFuture<'_, DeliveryAttempt> {
        Box::pin(async move {
            let stored = sqlx::query_as::<_, DeliveryAttempt>(
                r#"
                INSERT INTO delivery_attempts (
                    id, event_id, attempt_number, destination_url, request_headers,
                    request_body, status_code, response_body, error_message,
                    started_at, completed_at, latency_ms, success
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                RETURNING *
                "#,
            )
            .bind(DeliveryAttemptId::new())
            .bind(attempt.event_id)
            .bind(attempt.attempt_number)
            .bind(&attempt.destination_url)
            .bind(Json(&attempt.request_headers))
            .bind(Json(&attempt.request_body))
            .bind(attempt.status_code)
            .bind(&attempt.response_body)
            .bind(&attempt.error_message)
            .bind(attempt.started_at)
            .bind(attempt.completed_at)
            .bind(attempt.latency_ms)
            .bind(attempt.success)
            .fetch_one(&*self.pool)
            .await?;

            Ok(stored)
        })
    }

    fn list_for_event(&self, event_id: EventId) -> StoreFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move {
            let attempts = sqlx::query_as::<_, DeliveryAttempt>(
                r#"
                SELECT * FROM delivery_attempts
                WHERE event_id = $1
                ORDER BY attempt_number ASC, started_at ASC
                "#,
            )
            .bind(event_id)
            .fetch_all(&*self.pool)
            .await?;

            Ok(attempts)
        })
    }
}
