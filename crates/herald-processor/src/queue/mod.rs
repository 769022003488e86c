//! Persistent work queue with transaction-scoped claims.
//!
//! A worker opens a [`QueueTransaction`], claims a batch, works through it,
//! records every outcome through the same transaction and commits. Claimed
//! rows stay locked until the transaction ends, so concurrent claimants skip
//! them instead of waiting or delivering twice. Dropping a transaction
//! without committing rolls it back and makes the rows claimable again.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{FailedJob, JobKey, PendingJob, SubjectId};

use crate::{
    error::Result,
    retry::{RetryDecision, RetrySettings},
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryWorkQueue;
pub use postgres::PgWorkQueue;

/// Entry point to the queue.
#[async_trait]
pub trait WorkQueueStore: Send + Sync + fmt::Debug {
    /// Opens a transaction for one claim and resolve cycle.
    async fn begin(&self) -> Result<Box<dyn QueueTransaction>>;

    /// Queues `action` for `subject_id` unless the same pair is already
    /// queued. Returns whether a row was inserted. An empty `lang` means
    /// English.
    async fn enqueue(
        &self,
        subject_id: SubjectId,
        lang: &str,
        actor: &str,
        action: &str,
    ) -> Result<bool>;
}

/// An open claim and resolve cycle.
#[async_trait]
pub trait QueueTransaction: Send {
    /// Locks up to `limit` eligible jobs, skipping rows locked elsewhere.
    async fn claim_batch(&mut self, limit: usize) -> Result<Vec<PendingJob>>;

    /// Deletes successes and reschedules or drops failures.
    ///
    /// Keys without a row are ignored. Empty input issues no writes.
    async fn record_outcome(
        &mut self,
        success: &[JobKey],
        failures: &[FailedJob],
        retry: &RetrySettings,
    ) -> Result<OutcomeReport>;

    /// Makes the recorded outcomes durable and releases the claimed rows.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// What [`QueueTransaction::record_outcome`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeReport {
    /// Successful jobs deleted.
    pub completed: u64,
    /// Failed jobs pushed back with an incremented retry count.
    pub rescheduled: u64,
    /// Failed jobs deleted because their retry budget was spent.
    pub dropped: Vec<FailedJob>,
}

impl OutcomeReport {
    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.completed == 0 && self.rescheduled == 0 && self.dropped.is_empty()
    }
}

/// Failures split by their retry decision.
#[derive(Debug, Default)]
pub(crate) struct FailurePlan {
    pub(crate) reschedule: Vec<JobKey>,
    pub(crate) next_try: Option<DateTime<Utc>>,
    pub(crate) drop: Vec<FailedJob>,
}

impl FailurePlan {
    pub(crate) fn new(failures: &[FailedJob], retry: &RetrySettings, now: DateTime<Utc>) -> Self {
        let mut plan = Self::default();
        for failure in failures {
            match retry.decide(failure.retries, now) {
                RetryDecision::Reschedule { next_try, .. } => {
                    plan.next_try = Some(next_try);
                    plan.reschedule.push(failure.key.clone());
                },
                RetryDecision::Drop { reason } => {
                    tracing::debug!(
                        job = %failure.key,
                        retries = failure.retries,
                        %reason,
                        "dropping job"
                    );
                    plan.drop.push(failure.clone());
                },
            }
        }
        plan
    }

    pub(crate) fn drop_keys(&self) -> Vec<JobKey> {
        self.drop.iter().map(|f| f.key.clone()).collect()
    }
}
