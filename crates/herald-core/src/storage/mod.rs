//! Database access layer for the queue, configuration and user tables.
//!
//! Repositories translate between domain models and the PostgreSQL schema.
//! All SQL lives in this module; the processor crate reaches the database only
//! through these repositories.

use std::sync::Arc;

use sqlx::PgPool;

pub mod configuration;
pub mod pending_jobs;
pub mod schema;
pub mod users;

pub use schema::migrate;

use crate::error::Result;

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for queued jobs.
    pub pending_jobs: Arc<pending_jobs::Repository>,

    /// Repository for key/value configuration.
    pub configuration: Arc<configuration::Repository>,

    /// Repository for the subjects jobs act on.
    pub users: Arc<users::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates the repositories over `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            pending_jobs: Arc::new(pending_jobs::Repository::new(pool.clone())),
            configuration: Arc::new(configuration::Repository::new(pool.clone())),
            users: Arc::new(users::Repository::new(pool.clone())),
            pool,
        }
    }

    /// The shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);
        assert!(!storage.pool().is_closed());
    }
}
