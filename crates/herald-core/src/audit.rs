//! Audit trail for dispatch outcomes and terminal drops.
//!
//! The dispatcher records one event per attempted job and one per job that
//! exhausted its retries. Sinks implement `AuditLog`; recording is
//! fire-and-forget and never fails the job that produced the event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventKind {
    /// A verification email was dispatched.
    ProcessVerifyEmail,
    /// A password reset email was dispatched.
    ProcessResetPasswordEmail,
    /// A dispatch attempt failed or the job could not be handled.
    ProcessUserEmail,
    /// A job exhausted its retries and was removed from the queue.
    JobDropped,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProcessVerifyEmail => "ProcessVerifyEmail",
            Self::ProcessResetPasswordEmail => "ProcessResetPasswordEmail",
            Self::ProcessUserEmail => "ProcessUserEmail",
            Self::JobDropped => "JobDropped",
        };
        f.write_str(name)
    }
}

/// How it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation succeeded.
    Success,
    /// The operation failed with a machine-readable code.
    Error {
        /// Short error code such as `UserEmailDispatchError`.
        code: String,
    },
}

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique id of the record.
    pub id: Uuid,
    /// Event kind.
    pub kind: AuditEventKind,
    /// Who scheduled the work.
    pub actor: String,
    /// Who the work was for.
    pub recipient: String,
    /// Result of the operation.
    pub outcome: AuditOutcome,
    /// Free-form structured context.
    pub detail: serde_json::Value,
    /// When the record was created.
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates a successful event.
    pub fn success(
        kind: AuditEventKind,
        actor: impl Into<String>,
        recipient: impl Into<String>,
        detail: serde_json::Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            actor: actor.into(),
            recipient: recipient.into(),
            outcome: AuditOutcome::Success,
            detail,
            recorded_at,
        }
    }

    /// Creates a failed event carrying `code`.
    pub fn error(
        kind: AuditEventKind,
        actor: impl Into<String>,
        recipient: impl Into<String>,
        code: impl Into<String>,
        detail: serde_json::Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            actor: actor.into(),
            recipient: recipient.into(),
            outcome: AuditOutcome::Error { code: code.into() },
            detail,
            recorded_at,
        }
    }

    /// Whether the event records a success.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Success)
    }
}

/// Sink for audit events.
///
/// Implementations must not block dispatch for long and must swallow their own
/// failures.
#[async_trait::async_trait]
pub trait AuditLog: Send + Sync + fmt::Debug {
    /// Records one event.
    async fn record(&self, event: AuditEvent);
}

/// Audit sink that writes each event as a JSON line through `tracing`.
///
/// Successes go out at `info`, failures at `error`, both under the
/// `herald::audit` target so they can be routed separately.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait::async_trait]
impl AuditLog for TracingAuditLog {
    async fn record(&self, event: AuditEvent) {
        let json = serde_json::to_string(&event).unwrap_or_else(|e| format!("{event:?} ({e})"));
        if event.is_success() {
            info!(target: "herald::audit", kind = %event.kind, "{json}");
        } else {
            error!(target: "herald::audit", kind = %event.kind, "{json}");
        }
    }
}
