//! Email dispatch: the processor that drains `pending_jobs`.
//!
//! One iteration claims a batch, mails every job in claim order under the
//! engine's rate limit and resolves the whole batch in the claiming
//! transaction. A job that fails, names an unknown action or panics is
//! recorded as a failure; it never aborts the rest of the batch. A batch that
//! cannot be claimed counts as an idle iteration.

use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use herald_core::{
    AuditEvent, AuditEventKind, AuditLog, Clock, FailedJob, JobAction, PendingJob, SubjectId,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    processor::{ProcessContext, Processor},
    queue::WorkQueueStore,
};

pub mod mailer;
pub mod token;

pub use mailer::{HttpMailer, Mailer, MailerConfig, SendRequest};
pub use token::{HmacTokenIssuer, TokenClaims, TokenIssuer};

/// Audit code for actions outside the known set.
pub const UNSUPPORTED_EMAIL_TYPE: &str = "UnsupportedEmailType";
/// Audit code for token or transport failures.
pub const DISPATCH_ERROR: &str = "UserEmailDispatchError";
/// Audit code for jobs removed after their last retry.
pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";

/// Why a single job failed.
#[derive(Debug)]
struct JobFailure {
    code: &'static str,
    message: String,
}

type JobResult = std::result::Result<JobAction, JobFailure>;

/// Processor sending verification and password reset emails.
#[derive(Debug, Clone)]
pub struct EmailDispatchJob {
    queue: Arc<dyn WorkQueueStore>,
    mailer: Arc<dyn Mailer>,
    tokens: Arc<dyn TokenIssuer>,
    audit: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
}

impl EmailDispatchJob {
    /// Wires the job to its collaborators.
    pub fn new(
        queue: Arc<dyn WorkQueueStore>,
        mailer: Arc<dyn Mailer>,
        tokens: Arc<dyn TokenIssuer>,
        audit: Arc<dyn AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, mailer, tokens, audit, clock }
    }

    /// Schedules `action` for the subject. Returns `false` if it is already
    /// scheduled.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::Database` if the insert fails.
    pub async fn enqueue(
        &self,
        subject_id: SubjectId,
        lang: &str,
        actor: &str,
        action: JobAction,
    ) -> Result<bool> {
        self.queue.enqueue(subject_id, lang, actor, action.as_str()).await
    }

    async fn dispatch(&self, job: &PendingJob) -> JobResult {
        let token = self
            .tokens
            .generate(job.subject.id, &job.subject.name)
            .await
            .map_err(|e| JobFailure { code: DISPATCH_ERROR, message: e.to_string() })?;

        let action = job
            .parsed_action()
            .map_err(|message| JobFailure { code: UNSUPPORTED_EMAIL_TYPE, message })?;

        self.mailer
            .send(action, &job.subject.name, &job.lang, &token)
            .await
            .map_err(|e| JobFailure { code: DISPATCH_ERROR, message: e.to_string() })?;

        Ok(action)
    }

    async fn dispatch_contained(&self, job: &PendingJob) -> JobResult {
        match AssertUnwindSafe(self.dispatch(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(JobFailure { code: DISPATCH_ERROR, message: format!("panicked: {message}") })
            },
        }
    }

    async fn audit_attempt(&self, job: &PendingJob, result: &JobResult) {
        let now = self.clock.now_utc();
        let detail = json!({
            "subject_id": job.subject.id.0,
            "action": job.action,
            "lang": job.lang,
            "retries": job.retries,
        });

        let event = match result {
            Ok(action) => {
                let kind = match action {
                    JobAction::VerifyEmail => AuditEventKind::ProcessVerifyEmail,
                    JobAction::ResetPassword => AuditEventKind::ProcessResetPasswordEmail,
                };
                AuditEvent::success(kind, &job.actor, &job.subject.name, detail, now)
            },
            Err(failure) => {
                let mut detail = detail;
                detail["error"] = json!(failure.message);
                AuditEvent::error(
                    AuditEventKind::ProcessUserEmail,
                    &job.actor,
                    &job.subject.name,
                    failure.code,
                    detail,
                    now,
                )
            },
        };
        self.audit.record(event).await;
    }

    async fn audit_dropped(&self, job: &PendingJob, dropped: &FailedJob) {
        let event = AuditEvent::error(
            AuditEventKind::JobDropped,
            &job.actor,
            &job.subject.name,
            RETRIES_EXHAUSTED,
            json!({
                "subject_id": dropped.key.subject_id.0,
                "action": dropped.key.action,
                "retries": dropped.retries,
            }),
            self.clock.now_utc(),
        );
        self.audit.record(event).await;
    }
}

#[async_trait]
impl Processor for EmailDispatchJob {
    fn name(&self) -> &str {
        "email-dispatch"
    }

    async fn process(&self, ctx: &ProcessContext) -> Result<bool> {
        let policy = ctx.policy();
        let mut tx = match self.queue.begin().await {
            Ok(tx) => tx,
            Err(error) => {
                warn!(worker_id = ctx.worker_id(), %error, "could not open queue transaction");
                return Ok(false);
            },
        };
        let jobs = match tx.claim_batch(policy.batch_limit).await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(worker_id = ctx.worker_id(), %error, "could not claim email batch");
                return Ok(false);
            },
        };
        if jobs.is_empty() {
            return Ok(false);
        }
        debug!(worker_id = ctx.worker_id(), batch_size = jobs.len(), "claimed email batch");

        let mut success = Vec::with_capacity(jobs.len());
        let mut failures = Vec::new();

        for job in &jobs {
            ctx.acquire_permits(1).await;
            let result = self.dispatch_contained(job).await;
            match &result {
                Ok(action) => {
                    debug!(job = %job.key(), %action, "email dispatched");
                    success.push(job.key());
                },
                Err(failure) => {
                    warn!(
                        job = %job.key(),
                        retries = job.retries,
                        code = failure.code,
                        error = %failure.message,
                        "email dispatch failed"
                    );
                    failures.push(FailedJob::of(job));
                },
            }
            self.audit_attempt(job, &result).await;
        }

        let report = tx.record_outcome(&success, &failures, &policy.retry).await?;
        tx.commit().await?;

        // Drops are only final once the delete is committed.
        for dropped in &report.dropped {
            if let Some(job) = jobs.iter().find(|job| job.key() == dropped.key) {
                warn!(
                    job = %dropped.key,
                    retries = dropped.retries,
                    "job dropped after final retry"
                );
                self.audit_dropped(job, dropped).await;
            }
        }

        info!(
            worker_id = ctx.worker_id(),
            claimed = jobs.len(),
            sent = report.completed,
            rescheduled = report.rescheduled,
            dropped = report.dropped.len(),
            "email batch resolved"
        );
        Ok(true)
    }
}
