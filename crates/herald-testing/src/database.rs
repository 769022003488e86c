//! PostgreSQL access for integration tests.
//!
//! Tests connect to the database named by `DATABASE_URL`. When the variable
//! is not set the handle is `None` and database tests skip themselves, so the
//! rest of the suite still runs on machines without PostgreSQL. Tests that
//! use a handle should be `#[serial]` because [`TestDatabase::reset`] wipes
//! shared tables.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::storage::{self, Storage};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, info};

/// Migrated, emptied database.
#[derive(Clone)]
pub struct TestDatabase {
    pool: PgPool,
    storage: Arc<Storage>,
}

impl std::fmt::Debug for TestDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDatabase").finish_non_exhaustive()
    }
}

impl TestDatabase {
    /// Connects, migrates and resets the database.
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is not set.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the database is unreachable.
    pub async fn connect() -> Result<Option<Self>> {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            info!("DATABASE_URL not set, skipping database test");
            return Ok(None);
        };

        let options: PgConnectOptions =
            database_url.parse().context("failed to parse DATABASE_URL")?;
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await
            .context("failed to connect to test database")?;

        storage::migrate(&pool).await.context("failed to migrate test database")?;

        let database = Self { storage: Arc::new(Storage::new(pool.clone())), pool };
        database.reset().await?;
        Ok(Some(database))
    }

    /// Removes every row from the herald tables.
    ///
    /// # Errors
    ///
    /// Returns error if the truncate fails.
    pub async fn reset(&self) -> Result<()> {
        sqlx::query("TRUNCATE pending_jobs, users, configuration RESTART IDENTITY CASCADE")
            .execute(&self.pool)
            .await
            .context("failed to reset test database")?;
        debug!("test database reset");
        Ok(())
    }

    /// The connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Repositories over the pool.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// Raw contents of `pending_jobs` ordered by key, for byte-level
    /// comparisons.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn dump_pending_jobs(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT pj::TEXT FROM pending_jobs pj ORDER BY subject_id, action",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to dump pending_jobs")?;
        Ok(rows.into_iter().map(|(row,)| row).collect())
    }
}
