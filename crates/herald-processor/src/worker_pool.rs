//! Generation-tagged worker pools.
//!
//! A pool is a fixed set of worker tasks sharing one generation number and
//! one cancellation token. Resizing never mutates a pool: the engine bumps
//! the shared generation, starts a fresh pool and retires the old one. A
//! retired worker finishes the `process()` call it is in, notices that its
//! generation is stale and exits.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use herald_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::EngineShared,
    error::{ProcessorError, Result},
    processor::{ProcessContext, Processor},
};

/// Workers of one generation.
pub(crate) struct WorkerPool {
    generation: u64,
    size: usize,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers tagged with `generation`.
    pub(crate) fn spawn(
        generation: u64,
        size: usize,
        processor: &Arc<dyn Processor>,
        shared: &Arc<EngineShared>,
        clock: &Arc<dyn Clock>,
        parent_token: &CancellationToken,
    ) -> Self {
        let cancellation_token = parent_token.child_token();
        let handles = (0..size)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    generation,
                    processor: processor.clone(),
                    shared: shared.clone(),
                    clock: clock.clone(),
                    cancellation_token: cancellation_token.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(processor = processor.name(), generation, size, "spawned worker pool");
        Self { generation, size, cancellation_token, handles }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Asks every worker to stop without waiting for them.
    pub(crate) fn retire(&self) {
        debug!(generation = self.generation, "retiring worker pool");
        self.cancellation_token.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Waits for every worker of this pool to exit.
    pub(crate) async fn join(mut self) -> Result<()> {
        let mut first_error = None;
        for (worker_id, handle) in std::mem::take(&mut self.handles).into_iter().enumerate() {
            if let Err(join_error) = handle.await {
                error!(
                    generation = self.generation,
                    worker_id,
                    error = %join_error,
                    "worker task ended abnormally"
                );
                first_error.get_or_insert(ProcessorError::WorkerPanic {
                    worker_id,
                    error: join_error.to_string(),
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                generation = self.generation,
                active_workers = active,
                "worker pool dropped while running, cancelling its workers"
            );
            self.cancellation_token.cancel();
        }
    }
}

/// Counts a worker as live for as long as it exists.
struct LiveGuard(Arc<EngineShared>);

impl LiveGuard {
    fn new(shared: Arc<EngineShared>) -> Self {
        shared.counters.live_workers.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.counters.live_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker {
    id: usize,
    generation: u64,
    processor: Arc<dyn Processor>,
    shared: Arc<EngineShared>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let _live = LiveGuard::new(self.shared.clone());
        let name = self.processor.name().to_string();
        debug!(
            processor = %name,
            worker_id = self.id,
            generation = self.generation,
            "worker starting"
        );

        loop {
            if self.shared.current_generation() != self.generation
                || self.cancellation_token.is_cancelled()
            {
                break;
            }

            let policy = self.shared.policy();
            if policy.paused {
                if !self.idle(policy.idle_sleep).await {
                    break;
                }
                continue;
            }

            self.shared.counters.iterations.fetch_add(1, Ordering::Relaxed);
            let ctx = ProcessContext::new(
                self.id,
                self.generation,
                policy.clone(),
                self.shared.limiter.clone(),
            );
            let processor = self.processor.clone();
            let outcome = tokio::spawn(async move { processor.process(&ctx).await }).await;

            let keep_going = match outcome {
                Ok(Ok(true)) => {
                    self.shared.counters.processed.fetch_add(1, Ordering::Relaxed);
                    continue;
                },
                Ok(Ok(false)) => {
                    self.shared.counters.idle_iterations.fetch_add(1, Ordering::Relaxed);
                    self.idle(policy.idle_sleep).await
                },
                Ok(Err(error)) => {
                    self.shared.counters.failed_iterations.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        processor = %name,
                        worker_id = self.id,
                        error = %error,
                        retryable = error.is_retryable(),
                        "iteration failed"
                    );
                    self.idle(policy.idle_sleep).await
                },
                Err(join_error) => {
                    self.shared.counters.failed_iterations.fetch_add(1, Ordering::Relaxed);
                    error!(
                        processor = %name,
                        worker_id = self.id,
                        error = %join_error,
                        "iteration panicked"
                    );
                    self.idle(policy.idle_sleep).await
                },
            };
            if !keep_going {
                break;
            }
        }

        debug!(
            processor = %name,
            worker_id = self.id,
            generation = self.generation,
            "worker stopped"
        );
    }

    /// Sleeps unless the pool is cancelled first. Returns `false` on
    /// cancellation.
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.clock.sleep(duration) => true,
            () = self.cancellation_token.cancelled() => false,
        }
    }
}
