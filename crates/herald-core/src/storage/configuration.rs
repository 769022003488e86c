//! Repository for the key/value `configuration` table.

use std::{collections::HashMap, sync::Arc};

use sqlx::{Executor, PgPool, Postgres};

use crate::error::Result;

/// Repository for configuration entries.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Loads every entry as a map.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails. Unlike a cached read, a failure here
    /// is surfaced so the caller can keep its previous snapshot.
    pub async fn load_all(&self) -> Result<HashMap<String, String>> {
        load_all_with(&*self.pool).await
    }

    /// Inserts or replaces the given entries in one transaction.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails; nothing is written in that case.
    pub async fn upsert(&self, entries: &HashMap<String, String>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO configuration (key, value) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Removes an entry. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM configuration WHERE key = $1")
            .bind(key)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Loads every configuration entry through any executor.
///
/// Shared by the pooled repository and the single-connection bootstrap fetch.
///
/// # Errors
///
/// Returns error if the query fails.
pub async fn load_all_with<'e, E>(executor: E) -> Result<HashMap<String, String>>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM configuration").fetch_all(executor).await?;
    Ok(rows.into_iter().collect())
}
