//! Test infrastructure for herald.
//!
//! Provides a PostgreSQL handle for integration tests, recording and failing
//! doubles for every collaborator trait, and small processors for driving the
//! engine. Nothing here is used in production builds.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod doubles;
pub mod processors;

pub use database::TestDatabase;
pub use doubles::{
    MemoryConfigSource, RecordingAuditLog, RecordingMailer, SentMail, StaticTokenIssuer,
};
pub use herald_core::{Clock, RealClock, TestClock};
pub use processors::{CountingProcessor, ProcessorBehavior};

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
