//! PostgreSQL queue using `FOR UPDATE SKIP LOCKED` claims.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use herald_core::{
    storage::pending_jobs::Repository, Clock, FailedJob, JobKey, PendingJob, SubjectId,
};
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};

use super::{FailurePlan, OutcomeReport, QueueTransaction, WorkQueueStore};
use crate::{
    error::{ProcessorError, Result},
    retry::RetrySettings,
};

/// Queue backed by the `pending_jobs` table.
#[derive(Clone)]
pub struct PgWorkQueue {
    jobs: Arc<Repository>,
    clock: Arc<dyn Clock>,
}

impl PgWorkQueue {
    /// Creates a queue over the repository, timestamping with `clock`.
    pub fn new(jobs: Arc<Repository>, clock: Arc<dyn Clock>) -> Self {
        Self { jobs, clock }
    }
}

impl fmt::Debug for PgWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgWorkQueue").field("clock", &self.clock).finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkQueueStore for PgWorkQueue {
    async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        let tx = self
            .jobs
            .pool()
            .begin()
            .await
            .map_err(|e| ProcessorError::transient_claim(e.to_string()))?;

        Ok(Box::new(PgQueueTransaction {
            tx,
            jobs: self.jobs.clone(),
            clock: self.clock.clone(),
        }))
    }

    #[instrument(skip(self), fields(subject_id = %subject_id))]
    async fn enqueue(
        &self,
        subject_id: SubjectId,
        lang: &str,
        actor: &str,
        action: &str,
    ) -> Result<bool> {
        let inserted =
            self.jobs.enqueue(subject_id, lang, actor, action, self.clock.now_utc()).await?;
        debug!(inserted, "enqueue");
        Ok(inserted)
    }
}

struct PgQueueTransaction {
    tx: Transaction<'static, Postgres>,
    jobs: Arc<Repository>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl QueueTransaction for PgQueueTransaction {
    async fn claim_batch(&mut self, limit: usize) -> Result<Vec<PendingJob>> {
        self.jobs
            .claim_in_tx(&mut self.tx, limit, self.clock.now_utc())
            .await
            .map_err(|e| ProcessorError::transient_claim(e.to_string()))
    }

    async fn record_outcome(
        &mut self,
        success: &[JobKey],
        failures: &[FailedJob],
        retry: &RetrySettings,
    ) -> Result<OutcomeReport> {
        if success.is_empty() && failures.is_empty() {
            return Ok(OutcomeReport::default());
        }

        let plan = FailurePlan::new(failures, retry, self.clock.now_utc());

        let completed = self.jobs.delete_in_tx(&mut self.tx, success).await?;
        let rescheduled = match plan.next_try {
            Some(next_try) => {
                self.jobs.reschedule_in_tx(&mut self.tx, &plan.reschedule, next_try).await?
            },
            None => 0,
        };
        self.jobs.delete_in_tx(&mut self.tx, &plan.drop_keys()).await?;

        Ok(OutcomeReport { completed, rescheduled, dropped: plan.drop })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| ProcessorError::database(e.to_string()))
    }
}
