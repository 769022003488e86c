//! Hot-reconfigurable background job processing.
//!
//! A [`ProcessorEngine`] runs a [`Processor`] across a pool of tokio workers
//! whose size, pause flag, idle sleep, throughput, retry budget and batch size
//! come from the shared [`ConfigStore`]. Changing a value in the
//! `configuration` table reaches every running engine on the next refresh,
//! without a restart and without losing in-flight work.
//!
//! # Architecture
//!
//! 1. **ConfigStore** - periodically reloads the `configuration` table and
//!    publishes a change when the snapshot differs
//! 2. **ProcessorEngine** - applies policy changes in place or by starting a
//!    new pool generation
//! 3. **EmailDispatchJob** - claims jobs with `FOR UPDATE SKIP LOCKED`, mails
//!    them under the rate limit and resolves the batch in one transaction
//! 4. **WorkQueueStore** - PostgreSQL and in-memory queues with identical
//!    claim semantics
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use herald_core::{RealClock, TracingAuditLog};
//! use herald_processor::{
//!     ConfigStore, EmailDispatchJob, EngineConfig, HmacTokenIssuer, HttpMailer,
//!     InMemoryWorkQueue, MailerConfig, ProcessorEngine, ProcessorError,
//! };
//!
//! # async fn example(store: Arc<ConfigStore>) -> Result<(), ProcessorError> {
//! let clock = Arc::new(RealClock::new());
//! let lifespan = Duration::from_secs(3600);
//! let job = EmailDispatchJob::new(
//!     Arc::new(InMemoryWorkQueue::new(clock.clone())),
//!     Arc::new(HttpMailer::new(MailerConfig::default())?),
//!     Arc::new(HmacTokenIssuer::new("secret", "herald", lifespan, clock.clone())?),
//!     Arc::new(TracingAuditLog),
//!     clock.clone(),
//! );
//!
//! let engine = ProcessorEngine::new(
//!     Arc::new(job),
//!     store,
//!     EngineConfig::new(herald_processor::DEFAULT_NAMESPACE),
//!     clock,
//! );
//! engine.start().await?;
//! engine.shutdown(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config_store;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod retry;
mod worker_pool;

pub use config_store::{
    BootstrapParams, ConfigChange, ConfigSnapshot, ConfigSource, ConfigStore, PgConfigSource,
    RefreshOutcome,
};
pub use dispatch::{
    EmailDispatchJob, HmacTokenIssuer, HttpMailer, Mailer, MailerConfig, TokenIssuer,
};
pub use engine::{EngineConfig, EngineState, EngineStats, ProcessorEngine};
pub use error::{ProcessorError, Result};
pub use policy::{parse_interval, PolicyKeys, ProcessorPolicy};
pub use processor::{ProcessContext, Processor};
pub use queue::{InMemoryWorkQueue, OutcomeReport, PgWorkQueue, QueueTransaction, WorkQueueStore};
pub use rate_limit::{RateLimiter, MIN_RATE};
pub use retry::{RetryDecision, RetrySettings};

/// Namespace of the email dispatcher's policy keys.
pub const DEFAULT_NAMESPACE: &str = "user.processor.email";
