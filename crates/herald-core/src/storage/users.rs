//! Minimal access to the subjects jobs act on.
//!
//! Herald does not own user accounts; it only needs to create rows in tests
//! and tooling and to read the name the claim query joins in.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Subject, SubjectId},
};

/// Repository for the `users` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a user and returns it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a blank name, or a database
    /// error if the insert fails.
    pub async fn create(&self, username: &str) -> Result<Subject> {
        if username.trim().is_empty() {
            return Err(CoreError::InvalidInput("username must not be blank".to_string()));
        }

        let id: i64 = sqlx::query_scalar("INSERT INTO users (username) VALUES ($1) RETURNING id")
            .bind(username)
            .fetch_one(&*self.pool)
            .await?;

        Ok(Subject { id: SubjectId(id), name: username.to_string() })
    }

    /// Changes a user's name.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn rename(&self, id: SubjectId, username: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET username = $2 WHERE id = $1")
            .bind(id)
            .bind(username)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Looks up a user by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: SubjectId) -> Result<Option<Subject>> {
        let name: Option<String> = sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(name.map(|name| Subject { id, name }))
    }
}
