//! PostgreSQL event queue.
//!
//! Claiming is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
//! LOCKED) RETURNING *` statement: the row lock taken by the subquery makes
//! concurrent claimers skip to the next candidate instead of blocking or
//! double-claiming.

use std::{sync::Arc, time::Duration};

use sqlx::{types::Json, PgPool};

use super::{EventStore, StoreFuture};
use crate::{
    ledger::FailureLedger,
    models::{Event, EventId, EventInsert, NewEvent},
};

/// Repository for the `events` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }
}

impl EventStore for Repository {
    fn insert(&self, event: NewEvent) -> StoreFuture<'_, EventInsert> {
        Box::pin(async move {
            let inserted = sqlx::query_as::<_, Event>(
                r#"
                INSERT INTO events (id, status, payload, idempotency_key, destination_url, created_at)
                VALUES ($1, 'RECEIVED', $2, $3, $4, NOW())
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(EventId::new())
            .bind(Json(&event.payload))
            .bind(&event.idempotency_key)
            .bind(&event.destination_url)
            .fetch_optional(&*self.pool)
            .await?;

            if let Some(event) = inserted {
                return Ok(EventInsert { event, created: true });
            }

            let existing =
                sqlx::query_as::<_, Event>("SELECT * FROM events WHERE idempotency_key = $1")
                    .bind(&event.idempotency_key)
                    .fetch_one(&*self.pool)
                    .await?;

            Ok(EventInsert { event: existing, created: false })
        })
    }

    fn claim_next(&self, worker_id: String, stale_after: Duration) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let event = sqlx::query_as::<_, Event>(
                r#"
                UPDATE events
                SET status = 'PROCESSING', locked_at = NOW(), locked_by = $1
                WHERE id = (
                    SELECT id FROM events
                    WHERE status = 'RECEIVED'
                       OR (status = 'PROCESSING'
                           AND locked_at < NOW() - make_interval(secs => $2))
                    ORDER BY created_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                "#,
            )
            .bind(&worker_id)
            .bind(stale_after.as_secs_f64())
            .fetch_optional(&*self.pool)
            .await?;

            Ok(event)
        })
    }

    fn mark_delivered(&self, id: EventId, worker_id: String) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE events
                SET status = 'DELIVERED', delivered_at = NOW(), locked_at = NULL, locked_by = NULL
                WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2
                "#,
            )
            .bind(id)
            .bind(&worker_id)
            .execute(&*self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn mark_failed(
        &self,
        id: EventId,
        worker_id: String,
        ledger: FailureLedger,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE events
                SET status = 'FAILED', error_details = $3, failed_at = NOW(),
                    locked_at = NULL, locked_by = NULL
                WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2
                "#,
            )
            .bind(id)
            .bind(&worker_id)
            .bind(Json(&ledger))
            .execute(&*self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn find_by_id(&self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
            Ok(event)
        })
    }

    fn list(&self, limit: i64, offset: i64) -> StoreFuture<'_, Vec<Event>> {
        Box::pin(async move {
            let events = sqlx::query_as::<_, Event>(
                "SELECT * FROM events ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.pool)
            .await?;
            Ok(events)
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let _: Option<(uuid::Uuid,)> = sqlx::query_as("SELECT id FROM events LIMIT 1")
                .fetch_optional(&*self.pool)
                .await?;
            Ok(())
        })
    }
}
