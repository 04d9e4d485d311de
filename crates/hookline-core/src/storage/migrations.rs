//! Embedded schema migrations.
//!
//! Files are applied in name order, each inside its own transaction, and
//! recorded in `schema_migrations` so restarts skip what already ran.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::Result;

/// Migration files compiled into the binary, in application order.
pub const MIGRATIONS: &[(&str, &str)] =
    &[("0001_initial.sql", include_str!("../../migrations/0001_initial.sql"))];

/// Applies every migration not yet recorded. Returns how many ran.
///
/// # Errors
///
/// Returns `CoreError::Database` if a migration fails; that migration's
/// transaction is rolled back and later files are not attempted.
pub async fn run(pool: &PgPool) -> Result<usize> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            filename TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    let mut applied = 0;
    for (filename, sql) in MIGRATIONS {
        let mut tx = pool.begin().await?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT filename FROM schema_migrations WHERE filename = $1")
                .bind(filename)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_some() {
            debug!(filename, "migration already applied");
            continue;
        }

        sqlx::raw_sql(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (filename) VALUES ($1)")
            .bind(filename)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(filename, "applied migration");
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_sorted_and_non_empty() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert!(MIGRATIONS.iter().all(|(_, sql)| sql.contains("CREATE TABLE")));
    }
}
