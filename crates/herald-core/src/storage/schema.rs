//! Idempotent schema setup for the tables herald owns or reads.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "configuration",
        r#"
        CREATE TABLE IF NOT EXISTS configuration (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    ),
    (
        "users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            username TEXT NOT NULL
        )
        "#,
    ),
    (
        "pending_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS pending_jobs (
            subject_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            lang TEXT NOT NULL DEFAULT 'en',
            next_try TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            retries INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0),
            actor TEXT NOT NULL DEFAULT '',
            action TEXT NOT NULL,
            PRIMARY KEY (subject_id, action)
        )
        "#,
    ),
    (
        "pending_jobs next_try index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_pending_jobs_next_try
        ON pending_jobs(next_try)
        "#,
    ),
];

/// Creates missing tables and indexes.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        debug!(object = name, "ensuring schema object exists");
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
