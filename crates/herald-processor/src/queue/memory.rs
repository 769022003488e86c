//! In-memory queue with the same locking semantics as the PostgreSQL one.
//!
//! Claimed rows are entered into a lock set until their transaction ends,
//! and outcome writes are buffered until commit. Used by tests and by
//! anything that wants the engine without a database.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{
    normalize_lang, Clock, FailedJob, JobKey, PendingJob, RealClock, Subject, SubjectId,
};

use super::{FailurePlan, OutcomeReport, QueueTransaction, WorkQueueStore};
use crate::{
    error::{ProcessorError, Result},
    retry::RetrySettings,
};

#[derive(Debug, Default)]
struct QueueState {
    rows: BTreeMap<JobKey, PendingJob>,
    locked: HashSet<JobKey>,
    subjects: HashMap<SubjectId, String>,
    next_subject_id: i64,
    claim_failures: u32,
    commit_failures: u32,
    commits: u64,
}

/// Queue held in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(Arc::new(RealClock::new()))
    }
}

impl InMemoryWorkQueue {
    /// Creates an empty queue timestamping with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Arc::new(Mutex::new(QueueState::default())), clock }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subject that jobs can refer to.
    pub fn add_subject(&self, name: &str) -> Subject {
        let mut state = self.lock();
        state.next_subject_id += 1;
        let id = SubjectId(state.next_subject_id);
        state.subjects.insert(id, name.to_string());
        Subject { id, name: name.to_string() }
    }

    /// Inserts or replaces a row verbatim, registering its subject.
    pub fn seed(&self, job: PendingJob) {
        let mut state = self.lock();
        state.subjects.insert(job.subject.id, job.subject.name.clone());
        state.next_subject_id = state.next_subject_id.max(job.subject.id.0);
        state.rows.insert(job.key(), job);
    }

    /// Every row, ordered by key.
    pub fn jobs(&self) -> Vec<PendingJob> {
        self.lock().rows.values().cloned().collect()
    }

    /// The row for `key`, if any.
    pub fn job(&self, key: &JobKey) -> Option<PendingJob> {
        self.lock().rows.get(key).cloned()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    /// Whether the queue holds no rows.
    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }

    /// Rows currently locked by open transactions.
    pub fn locked_count(&self) -> usize {
        self.lock().locked.len()
    }

    /// Committed transactions so far.
    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    /// Makes the next `count` claims fail.
    pub fn fail_next_claims(&self, count: u32) {
        self.lock().claim_failures = count;
    }

    /// Makes the next `count` commits fail. A failed commit discards its
    /// buffered writes and releases its locks.
    pub fn fail_next_commits(&self, count: u32) {
        self.lock().commit_failures = count;
    }
}

#[async_trait]
impl WorkQueueStore for InMemoryWorkQueue {
    async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            clock: self.clock.clone(),
            claimed: Vec::new(),
            deletes: Vec::new(),
            reschedules: Vec::new(),
        }))
    }

    async fn enqueue(
        &self,
        subject_id: SubjectId,
        lang: &str,
        actor: &str,
        action: &str,
    ) -> Result<bool> {
        let now = self.clock.now_utc();
        let mut state = self.lock();
        let Some(name) = state.subjects.get(&subject_id).cloned() else {
            return Err(ProcessorError::database(format!("unknown subject {subject_id}")));
        };

        let key = JobKey::new(subject_id, action);
        if state.rows.contains_key(&key) {
            return Ok(false);
        }

        state.rows.insert(key, PendingJob {
            subject: Subject { id: subject_id, name },
            lang: normalize_lang(lang),
            retries: 0,
            next_try: now,
            actor: actor.to_string(),
            action: action.to_string(),
        });
        Ok(true)
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<QueueState>>,
    clock: Arc<dyn Clock>,
    claimed: Vec<JobKey>,
    deletes: Vec<JobKey>,
    reschedules: Vec<(JobKey, DateTime<Utc>)>,
}

impl MemoryTransaction {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueTransaction for MemoryTransaction {
    async fn claim_batch(&mut self, limit: usize) -> Result<Vec<PendingJob>> {
        let now = self.clock.now_utc();
        let batch = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.claim_failures > 0 {
                state.claim_failures -= 1;
                return Err(ProcessorError::transient_claim("queue unavailable"));
            }

            let mut eligible: Vec<PendingJob> = state
                .rows
                .values()
                .filter(|job| job.is_eligible(now) && !state.locked.contains(&job.key()))
                .cloned()
                .collect();
            eligible.sort_by_key(|job| job.next_try);
            eligible.truncate(limit);

            for job in &eligible {
                state.locked.insert(job.key());
            }
            eligible
        };

        self.claimed.extend(batch.iter().map(PendingJob::key));
        Ok(batch)
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
        let (completed, rescheduled) = {
            let state = self.lock();
            let present = |keys: &[JobKey]| {
                keys.iter().filter(|k| state.rows.contains_key(*k)).count() as u64
            };
            (present(success), present(plan.reschedule.as_slice()))
        };

        self.deletes.extend_from_slice(success);
        self.deletes.extend(plan.drop_keys());
        if let Some(next_try) = plan.next_try {
            self.reschedules.extend(plan.reschedule.iter().map(|k| (k.clone(), next_try)));
        }

        Ok(OutcomeReport { completed, rescheduled, dropped: plan.drop })
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.commit_failures > 0 {
                state.commit_failures -= 1;
                return Err(ProcessorError::database("commit failed"));
            }
        }

        let claimed = std::mem::take(&mut self.claimed);
        let deletes = std::mem::take(&mut self.deletes);
        let reschedules = std::mem::take(&mut self.reschedules);

        let mut state = self.lock();
        for key in &deletes {
            state.rows.remove(key);
        }
        for (key, next_try) in reschedules {
            if let Some(job) = state.rows.get_mut(&key) {
                job.next_try = next_try;
                job.retries += 1;
            }
        }
        for key in &claimed {
            state.locked.remove(key);
        }
        state.commits += 1;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.claimed.is_empty() {
            return;
        }
        let claimed = std::mem::take(&mut self.claimed);
        let mut state = self.lock();
        for key in &claimed {
            state.locked.remove(key);
        }
    }
}
