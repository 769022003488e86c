//! Core domain models, audit events and persistence for herald.
//!
//! Provides the strongly-typed job and configuration primitives, the clock
//! abstraction, audit event plumbing, and the PostgreSQL repositories for the
//! `pending_jobs`, `configuration` and `users` tables. The processor crate
//! builds its engine and stores on top of these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use audit::{AuditEvent, AuditEventKind, AuditLog, AuditOutcome, TracingAuditLog};
pub use error::{CoreError, Result};
pub use models::{
    normalize_lang, FailedJob, JobAction, JobKey, PendingJob, Subject, SubjectId, DEFAULT_LANG,
};
pub use time::{Clock, RealClock, TestClock};
