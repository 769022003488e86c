//! The unit of work an engine runs.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{error::Result, policy::ProcessorPolicy, rate_limit::RateLimiter};

/// A pluggable unit of work.
///
/// `process` returns `Ok(true)` when it found and attempted work, in which
/// case the worker calls it again immediately, and `Ok(false)` when there was
/// nothing to do, in which case the worker sleeps for the idle interval.
/// Errors and panics are contained by the worker and count as a failed
/// iteration.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs one iteration.
    async fn process(&self, ctx: &ProcessContext) -> Result<bool>;
}

/// What a processor sees of its engine during one iteration.
#[derive(Clone)]
pub struct ProcessContext {
    worker_id: usize,
    generation: u64,
    policy: Arc<ProcessorPolicy>,
    limiter: Arc<RateLimiter>,
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("worker_id", &self.worker_id)
            .field("generation", &self.generation)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ProcessContext {
    /// Creates a context. Engines build one per iteration; tests build them
    /// directly to drive a processor without an engine.
    pub fn new(
        worker_id: usize,
        generation: u64,
        policy: Arc<ProcessorPolicy>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self { worker_id, generation, policy, limiter }
    }

    /// Waits for `permits` permits from the engine's shared limiter.
    pub async fn acquire_permits(&self, permits: u32) {
        self.limiter.acquire(permits).await;
    }

    /// Policy in effect when the iteration started.
    pub fn policy(&self) -> &ProcessorPolicy {
        &self.policy
    }

    /// Worker running the iteration.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Pool generation of the worker.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
