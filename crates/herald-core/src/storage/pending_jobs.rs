//! Repository for the `pending_jobs` work queue.
//!
//! Claiming and resolving are transaction-scoped: the row locks taken by
//! [`Repository::claim_in_tx`] protect the claimed rows only until the
//! transaction ends, so outcomes must be written through the same
//! transaction before it commits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{normalize_lang, JobKey, PendingJob, SubjectId},
};

/// Repository for queue rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a job eligible at `now` unless one already exists for the
    /// same `(subject_id, action)`.
    ///
    /// Returns `true` when a row was inserted and `false` when the job was
    /// already queued.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails, e.g. for an unknown subject.
    pub async fn enqueue(
        &self,
        subject_id: SubjectId,
        lang: &str,
        actor: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO pending_jobs (subject_id, lang, next_try, retries, actor, action)
            VALUES ($1, $2, $3, 0, $4, $5)
            ON CONFLICT (subject_id, action) DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(normalize_lang(lang))
        .bind(now)
        .bind(actor)
        .bind(action)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Locks and returns up to `limit` jobs eligible at `now`.
    ///
    /// Uses `FOR UPDATE OF pj SKIP LOCKED` so concurrent claimants receive
    /// disjoint batches without waiting on each other. Oldest `next_try`
    /// first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn claim_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingJob>> {
        let jobs = sqlx::query_as::<_, PendingJob>(
            r#"
            SELECT pj.subject_id, u.username, pj.lang, pj.next_try, pj.retries,
                   pj.actor, pj.action
            FROM pending_jobs pj
            JOIN users u ON u.id = pj.subject_id
            WHERE pj.next_try <= $1
            ORDER BY pj.next_try ASC
            LIMIT $2
            FOR UPDATE OF pj SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut **tx)
        .await?;

        Ok(jobs)
    }

    /// Deletes the given jobs. Keys with no row are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: &[JobKey],
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let (ids, actions) = split_keys(keys);

        let result = sqlx::query(
            r#"
            DELETE FROM pending_jobs pj
            USING UNNEST($1::BIGINT[], $2::TEXT[]) AS k(subject_id, action)
            WHERE pj.subject_id = k.subject_id AND pj.action = k.action
            "#,
        )
        .bind(ids)
        .bind(actions)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Pushes the given jobs to `next_try` and increments their retry count.
    /// Keys with no row are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reschedule_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        keys: &[JobKey],
        next_try: DateTime<Utc>,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let (ids, actions) = split_keys(keys);

        let result = sqlx::query(
            r#"
            UPDATE pending_jobs pj
            SET next_try = $3, retries = pj.retries + 1
            FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS k(subject_id, action)
            WHERE pj.subject_id = k.subject_id AND pj.action = k.action
            "#,
        )
        .bind(ids)
        .bind(actions)
        .bind(next_try)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds a job by key regardless of eligibility.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, key: &JobKey) -> Result<Option<PendingJob>> {
        let job = sqlx::query_as::<_, PendingJob>(
            r#"
            SELECT pj.subject_id, u.username, pj.lang, pj.next_try, pj.retries,
                   pj.actor, pj.action
            FROM pending_jobs pj
            JOIN users u ON u.id = pj.subject_id
            WHERE pj.subject_id = $1 AND pj.action = $2
            "#,
        )
        .bind(key.subject_id)
        .bind(&key.action)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Number of queued jobs.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM pending_jobs")
            .fetch_one(&*self.pool)
            .await?;
        Ok(count)
    }
}

fn split_keys(keys: &[JobKey]) -> (Vec<i64>, Vec<String>) {
    keys.iter().map(|k| (k.subject_id.0, k.action.clone())).unzip()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_split_into_parallel_arrays() {
        let keys = vec![
            JobKey::new(SubjectId(1), "VerifyEmail"),
            JobKey::new(SubjectId(2), "ResetPassword"),
        ];
        let (ids, actions) = split_keys(&keys);
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(actions, vec!["VerifyEmail".to_string(), "ResetPassword".to_string()]);
    }
}
