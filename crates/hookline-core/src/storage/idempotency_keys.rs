//! PostgreSQL idempotency key table.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use sqlx::{types::Json, PgPool};

use super::{IdempotencyStore, StoreFuture};
use crate::models::{IdempotencyRecord, IdempotencyStatus};

/// Repository for the `idempotency_keys` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

impl IdempotencyStore for Repository {
    fn insert_processing(&self, key: String, request_hash: String) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            // The primary key on `key` is the arbiter between racing requests.
            let result = sqlx::query(
                r#"
                INSERT INTO idempotency_keys (key, request_hash, status, locked_at, created_at, updated_at)
                VALUES ($1, $2, 'PROCESSING', NOW(), NOW(), NOW())
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(&key)
            .bind(&request_hash)
            .execute(&*self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn find(&self, key: String) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move {
            let record = sqlx::query_as::<_, IdempotencyRecord>(
                "SELECT * FROM idempotency_keys WHERE key = $1",
            )
            .bind(&key)
            .fetch_optional(&*self.pool)
            .await?;
            Ok(record)
        })
    }

    fn reclaim_stale(&self, key: String, lock_timeout: Duration) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE idempotency_keys
                SET locked_at = NOW(), updated_at = NOW()
                WHERE key = $1
                  AND status = 'PROCESSING'
                  AND locked_at < NOW() - make_interval(secs => $2)
                "#,
            )
            .bind(&key)
            .bind(lock_timeout.as_secs_f64())
            .execute(&*self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn finalize(
        &self,
        key: String,
        status: IdempotencyStatus,
        response_status: i32,
        response_body: Value,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE idempotency_keys
                SET status = $2, response_status = $3, response_body = $4, updated_at = NOW()
                WHERE key = $1 AND status = 'PROCESSING'
                "#,
            )
            .bind(&key)
            .bind(status.as_str())
            .bind(response_status)
            .bind(Json(&response_body))
            .execute(&*self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }
}
