//! PostgreSQL dead-letter queue.
//!
//! Status changes are guarded on the prior status inside the `WHERE`
//! clause. The retry-failure transition increments `retry_count` and picks
//! the next status in the same statement, so two operators retrying the
//! same entry cannot both observe the old count. A RETRYING entry whose
//! retry stamp is older than the reclaim window may be claimed again, so a
//! retry interrupted between claim and outcome does not strand the entry.

use std::{sync::Arc, time::Duration};

use sqlx::{types::Json, PgPool};

use super::{DeadLetterStore, StoreFuture};
use crate::models::{DeadLetterEntry, DeadLetterId, EventId, NewDeadLetter};

/// Repository for the `dead_letter_queue` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn transition(
        &self,
        sql: &'static str,
        id: DeadLetterId,
    ) -> crate::error::Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(entry)
    }
}

impl DeadLetterStore for Repository {
    fn insert(&self, entry: NewDeadLetter) -> StoreFuture<'_, DeadLetterEntry> {
        Box::pin(async move {
            // A worker that reclaimed a stale event may fail it a second time;
            // the unique event id keeps a single entry per event.
            let stored = sqlx::query_as::<_, DeadLetterEntry>(
                r#"
                INSERT INTO dead_letter_queue (
                    id, original_event_id, idempotency_key, payload, error_details,
                    status, retry_count, failed_at
                ) VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, NOW())
                ON CONFLICT (original_event_id)
                DO UPDATE SET original_event_id = EXCLUDED.original_event_id
                RETURNING *
                "#,
            )
            .bind(DeadLetterId::new())
            .bind(entry.original_event_id)
            .bind(&entry.idempotency_key)
            .bind(Json(&entry.payload))
            .bind(Json(&entry.error_details))
            .fetch_one(&*self.pool)
            .await?;

            Ok(stored)
        })
    }

    fn find_by_id(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.transition("SELECT * FROM dead_letter_queue WHERE id = $1", id))
    }

    fn find_by_event(&self, event_id: EventId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(async move {
            let entry = sqlx::query_as::<_, DeadLetterEntry>(
                "SELECT * FROM dead_letter_queue WHERE original_event_id = $1",
            )
            .bind(event_id)
            .fetch_optional(&*self.pool)
            .await?;
            Ok(entry)
        })
    }

    fn list_pending(&self) -> StoreFuture<'_, Vec<DeadLetterEntry>> {
        Box::pin(async move {
            let entries = sqlx::query_as::<_, DeadLetterEntry>(
                "SELECT * FROM dead_letter_queue WHERE status = 'PENDING' ORDER BY failed_at ASC",
            )
            .fetch_all(&*self.pool)
            .await?;
            Ok(entries)
        })
    }

    fn begin_retry(
        &self,
        id: DeadLetterId,
        reclaim_after: Duration,
    ) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(async move {
            let entry = sqlx::query_as::<_, DeadLetterEntry>(
                r#"
                UPDATE dead_letter_queue
                SET status = 'RETRYING', retry_started_at = NOW()
                WHERE id = $1
                  AND (status = 'PENDING'
                       OR (status = 'RETRYING'
                           AND retry_started_at < NOW() - make_interval(secs => $2)))
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(reclaim_after.as_secs_f64())
            .fetch_optional(&*self.pool)
            .await?;
            Ok(entry)
        })
    }

    fn complete_retry(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.transition(
            r#"
            UPDATE dead_letter_queue SET status = 'RESOLVED', resolved_at = NOW()
            WHERE id = $1 AND status = 'RETRYING'
            RETURNING *
            "#,
            id,
        ))
    }

    fn fail_retry(
        &self,
        id: DeadLetterId,
        max_retries: i32,
    ) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(async move {
            let entry = sqlx::query_as::<_, DeadLetterEntry>(
                r#"
                UPDATE dead_letter_queue
                SET retry_count = retry_count + 1,
                    status = CASE WHEN retry_count + 1 >= $2 THEN 'ABANDONED' ELSE 'PENDING' END,
                    resolved_at = CASE WHEN retry_count + 1 >= $2 THEN NOW() ELSE NULL END
                WHERE id = $1 AND status = 'RETRYING'
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(max_retries)
            .fetch_optional(&*self.pool)
            .await?;
            Ok(entry)
        })
    }

    fn resolve(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.transition(
            r#"
            UPDATE dead_letter_queue SET status = 'RESOLVED', resolved_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
            id,
        ))
    }

    fn abandon(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.transition(
            r#"
            UPDATE dead_letter_queue SET status = 'ABANDONED', resolved_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
            id,
        ))
    }
}
