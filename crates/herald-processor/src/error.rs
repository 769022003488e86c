//! Error types for the processor engine and its units of work.
//!
//! Errors are contained at the smallest boundary that can handle them: a
//! failing job is classified inside the dispatcher, a failing iteration is
//! logged by the worker loop. Nothing here is allowed to terminate a worker.

use std::time::Duration;

use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for processor operations.
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Failures raised by the engine, the stores and the dispatcher.
#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    /// The queue could not be reached to claim work.
    #[error("failed to claim work: {message}")]
    TransientClaim {
        /// Underlying failure
        message: String,
    },

    /// Mail transport rejected or failed to send a message.
    #[error("dispatch failed: {message}")]
    Dispatch {
        /// Transport error message
        message: String,
    },

    /// The token issuer could not produce a token.
    #[error("token issue failed: {message}")]
    TokenIssue {
        /// Issuer error message
        message: String,
    },

    /// Configuration could not be loaded from its source.
    #[error("configuration load failed: {message}")]
    ConfigLoad {
        /// Source error message
        message: String,
    },

    /// A queue write failed after work was claimed.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Invalid static configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What was wrong
        message: String,
    },

    /// A unit of work panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker that observed the panic
        worker_id: usize,
        /// Panic description
        error: String,
    },

    /// Workers did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The timeout that elapsed
        timeout: Duration,
    },
}

impl ProcessorError {
    /// Creates a claim error.
    pub fn transient_claim(message: impl Into<String>) -> Self {
        Self::TransientClaim { message: message.into() }
    }

    /// Creates a dispatch error.
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch { message: message.into() }
    }

    /// Creates a token issue error.
    pub fn token_issue(message: impl Into<String>) -> Self {
        Self::TokenIssue { message: message.into() }
    }

    /// Creates a configuration load error.
    pub fn config_load(message: impl Into<String>) -> Self {
        Self::ConfigLoad { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the failed operation may succeed if attempted again later.
    ///
    /// Claim, dispatch, token, load and database failures are retryable.
    /// Static misconfiguration, panics and shutdown timeouts are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientClaim { .. }
            | Self::Dispatch { .. }
            | Self::TokenIssue { .. }
            | Self::ConfigLoad { .. }
            | Self::Database { .. } => true,

            Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }
}

impl From<CoreError> for ProcessorError {
    fn from(err: CoreError) -> Self {
        Self::database(err.to_string())
    }
}
