//! Domain models for queued work and strongly-typed identifiers.
//!
//! A `PendingJob` is one row of the `pending_jobs` table joined with the
//! subject it acts on. Rows are keyed by `(subject_id, action)` so that at most
//! one unresolved job exists per subject and kind of work.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Language used when a job is enqueued without one.
pub const DEFAULT_LANG: &str = "en";

/// Strongly-typed identifier of the entity a job acts on (a user row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub i64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SubjectId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for SubjectId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubjectId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for SubjectId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// The entity a job acts on: its id and the name used as mail recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Primary key of the subject row.
    pub id: SubjectId,
    /// Login name, which doubles as the recipient address.
    pub name: String,
}

/// Closed set of work kinds the email dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobAction {
    /// Send an email address verification link.
    VerifyEmail,
    /// Send a password reset link.
    ResetPassword,
}

impl JobAction {
    /// Stored representation of the action.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VerifyEmail => "VerifyEmail",
            Self::ResetPassword => "ResetPassword",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VerifyEmail" => Ok(Self::VerifyEmail),
            "ResetPassword" => Ok(Self::ResetPassword),
            other => Err(format!("unknown job action: {other:?}")),
        }
    }
}

/// Unique key of a queue row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Subject the job acts on.
    pub subject_id: SubjectId,
    /// Raw action text as stored.
    pub action: String,
}

impl JobKey {
    /// Builds a key from its parts.
    pub fn new(subject_id: SubjectId, action: impl Into<String>) -> Self {
        Self { subject_id, action: action.into() }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.action)
    }
}

/// One unresolved unit of work claimed from the queue.
///
/// `action` is kept as raw text because rows may carry kinds this build does
/// not know about; those are classified as failures at dispatch time rather
/// than rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    /// Entity the job acts on.
    pub subject: Subject,
    /// Language tag for templates.
    pub lang: String,
    /// Failed attempts so far.
    pub retries: i32,
    /// Earliest time the job may be claimed.
    pub next_try: DateTime<Utc>,
    /// Who scheduled the job.
    pub actor: String,
    /// Raw action text.
    pub action: String,
}

impl PendingJob {
    /// Queue key of this job.
    pub fn key(&self) -> JobKey {
        JobKey::new(self.subject.id, self.action.clone())
    }

    /// Parsed action, if it belongs to the known set.
    pub fn parsed_action(&self) -> Result<JobAction, String> {
        self.action.parse()
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_try <= now
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for PendingJob {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            subject: Subject { id: row.try_get("subject_id")?, name: row.try_get("username")? },
            lang: row.try_get("lang")?,
            retries: row.try_get("retries")?,
            next_try: row.try_get("next_try")?,
            actor: row.try_get("actor")?,
            action: row.try_get("action")?,
        })
    }
}

/// A job whose attempt failed, with the retry count it was claimed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    /// Queue key of the failed job.
    pub key: JobKey,
    /// Value of `retries` when the job was claimed.
    pub retries: i32,
}

impl FailedJob {
    /// Records a failure of `job` at its current retry count.
    pub fn of(job: &PendingJob) -> Self {
        Self { key: job.key(), retries: job.retries }
    }
}

/// Normalises an enqueue language tag; empty means English.
pub fn normalize_lang(lang: &str) -> String {
    let trimmed = lang.trim();
    if trimmed.is_empty() {
        DEFAULT_LANG.to_string()
    } else {
        trimmed.to_string()
    }
}
