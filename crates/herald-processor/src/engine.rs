//! Hot-reconfigurable processor engine.
//!
//! One engine drives one [`Processor`] across a pool of workers sized by the
//! processor's namespace in the [`ConfigStore`]. Policy changes reach a
//! running engine in two ways: the store's change notifications and a
//! periodic monitor that re-reads the policy on its own. Pause, idle sleep,
//! throughput, retry and batch settings are swapped in place. A new worker
//! count starts a new pool generation and retires the old pool without
//! waiting for it.
//!
//! ```text
//!   Initializing ──start──▶ Running ◀──▶ Paused
//!                              │  ▲        │
//!                              ▼  │        ▼
//!                           Reconfiguring ─┘
//!                              │
//!                  shutdown ──▶ Stopped
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use herald_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config_store::{ConfigChange, ConfigStore},
    error::{ProcessorError, Result},
    policy::{PolicyKeys, ProcessorPolicy},
    processor::Processor,
    rate_limit::RateLimiter,
    worker_pool::WorkerPool,
};

/// Default interval of the policy monitor.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Static engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Configuration key prefix of the processor's policy.
    pub namespace: String,

    /// How often the engine re-reads its policy without a notification.
    pub monitor_interval: Duration,
}

impl EngineConfig {
    /// Settings for `namespace` with the default monitor interval.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), monitor_interval: DEFAULT_MONITOR_INTERVAL }
    }

    /// Overrides the monitor interval.
    #[must_use]
    pub fn with_monitor_interval(mut self, monitor_interval: Duration) -> Self {
        self.monitor_interval = monitor_interval;
        self
    }
}

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Created, not started.
    Initializing,
    /// Workers are calling the processor.
    Running,
    /// Workers are alive but skip the processor.
    Paused,
    /// A policy change is being applied.
    Reconfiguring,
    /// Shut down; terminal.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Reconfiguring => "reconfiguring",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time counters of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Worker tasks currently alive, across all generations.
    pub live_workers: usize,
    /// Current pool generation.
    pub generation: u64,
    /// Processor invocations.
    pub iterations: u64,
    /// Invocations that found work.
    pub processed: u64,
    /// Invocations that found nothing.
    pub idle_iterations: u64,
    /// Invocations that failed or panicked.
    pub failed_iterations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) live_workers: AtomicUsize,
    pub(crate) iterations: AtomicU64,
    pub(crate) processed: AtomicU64,
    pub(crate) idle_iterations: AtomicU64,
    pub(crate) failed_iterations: AtomicU64,
}

/// State shared between an engine and its workers.
#[derive(Debug)]
pub(crate) struct EngineShared {
    generation: AtomicU64,
    policy: RwLock<Arc<ProcessorPolicy>>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) counters: Counters,
}

impl EngineShared {
    fn new(policy: ProcessorPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            generation: AtomicU64::new(0),
            limiter: Arc::new(RateLimiter::new(policy.throughput, clock)),
            policy: RwLock::new(Arc::new(policy)),
            counters: Counters::default(),
        }
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn policy(&self) -> Arc<ProcessorPolicy> {
        self.policy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_policy(&self, policy: ProcessorPolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(policy);
    }
}

#[derive(Default)]
struct Pools {
    current: Option<WorkerPool>,
    retired: Vec<WorkerPool>,
}

struct EngineInner {
    processor: Arc<dyn Processor>,
    store: Arc<ConfigStore>,
    keys: PolicyKeys,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    shared: Arc<EngineShared>,
    state: Mutex<EngineState>,
    pools: tokio::sync::Mutex<Pools>,
    cancellation_token: CancellationToken,
}

impl EngineInner {
    fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn settled_state(policy: &ProcessorPolicy) -> EngineState {
        if policy.paused {
            EngineState::Paused
        } else {
            EngineState::Running
        }
    }

    async fn reconfigure(&self) {
        let mut pools = self.pools.lock().await;
        if !matches!(self.state(), EngineState::Running | EngineState::Paused) {
            return;
        }

        let policy = ProcessorPolicy::load(&self.store, &self.keys);
        let previous = self.shared.policy();
        let running_size = pools.current.as_ref().map_or(0, WorkerPool::size);
        pools.retired.retain(|pool| !pool.is_finished());

        if *previous == policy && running_size == policy.threads {
            debug!(processor = self.processor.name(), "policy unchanged");
            return;
        }

        self.set_state(EngineState::Reconfiguring);

        if previous.paused != policy.paused {
            info!(processor = self.processor.name(), paused = policy.paused, "pause flag changed");
        }
        self.shared.limiter.set_rate(policy.throughput);
        let threads = policy.threads;
        let settled = Self::settled_state(&policy);
        self.shared.set_policy(policy);

        if running_size != threads {
            let generation = self.shared.next_generation();
            let pool = WorkerPool::spawn(
                generation,
                threads,
                &self.processor,
                &self.shared,
                &self.clock,
                &self.cancellation_token,
            );
            if let Some(old) = pools.current.replace(pool) {
                info!(
                    processor = self.processor.name(),
                    from = old.size(),
                    to = threads,
                    old_generation = old.generation(),
                    generation,
                    "resized worker pool"
                );
                old.retire();
                pools.retired.push(old);
            }
        }

        self.set_state(settled);
    }
}

/// Runs a [`Processor`] under a live, store-driven policy.
pub struct ProcessorEngine {
    inner: Arc<EngineInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProcessorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorEngine")
            .field("processor", &self.inner.processor.name())
            .field("config", &self.inner.config)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl ProcessorEngine {
    /// Creates an engine in the `Initializing` state. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        processor: Arc<dyn Processor>,
        store: Arc<ConfigStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = PolicyKeys::new(&config.namespace);
        let policy = ProcessorPolicy::load(&store, &keys);
        let shared = Arc::new(EngineShared::new(policy, clock.clone()));

        Self {
            inner: Arc::new(EngineInner {
                processor,
                store,
                keys,
                config,
                clock,
                shared,
                state: Mutex::new(EngineState::Initializing),
                pools: tokio::sync::Mutex::new(Pools::default()),
                cancellation_token: CancellationToken::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Reads the policy, spawns the first pool and starts the monitor.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::Configuration` if the engine was already
    /// started or stopped.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut pools = inner.pools.lock().await;
        let state = inner.state();
        if state != EngineState::Initializing {
            return Err(ProcessorError::configuration(format!(
                "engine for {} cannot start from state {state}",
                inner.processor.name()
            )));
        }

        // Subscribed before the first load so no change slips in between.
        let changes = inner.store.subscribe();
        let policy = ProcessorPolicy::load(&inner.store, &inner.keys);
        info!(
            processor = inner.processor.name(),
            namespace = %inner.config.namespace,
            threads = policy.threads,
            paused = policy.paused,
            throughput = policy.throughput,
            batch_limit = policy.batch_limit,
            "starting processor engine"
        );

        inner.shared.limiter.set_rate(policy.throughput);
        let threads = policy.threads;
        let settled = EngineInner::settled_state(&policy);
        inner.shared.set_policy(policy);

        let generation = inner.shared.next_generation();
        pools.current = Some(WorkerPool::spawn(
            generation,
            threads,
            &inner.processor,
            &inner.shared,
            &inner.clock,
            &inner.cancellation_token,
        ));
        inner.set_state(settled);
        drop(pools);

        let handle = tokio::spawn(monitor(inner.clone(), changes));
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Re-reads the policy now and applies any change.
    pub async fn reconfigure(&self) {
        self.inner.reconfigure().await;
    }

    /// Stops every worker and waits up to `timeout` for them to exit.
    ///
    /// In-flight `process()` calls are allowed to finish. Calling this on a
    /// stopped engine is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::ShutdownTimeout` if workers are still running
    /// when the timeout elapses, or `ProcessorError::WorkerPanic` if a worker
    /// task ended abnormally.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        let pools = {
            let mut pools = inner.pools.lock().await;
            if inner.state() == EngineState::Stopped {
                return Ok(());
            }
            inner.set_state(EngineState::Stopped);
            inner.shared.next_generation();
            inner.cancellation_token.cancel();
            std::mem::take(&mut *pools)
        };

        info!(
            processor = inner.processor.name(),
            live_workers = self.stats().live_workers,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "shutting down processor engine"
        );

        let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        let join_all = async move {
            if let Some(monitor) = monitor {
                if let Err(join_error) = monitor.await {
                    warn!(error = %join_error, "policy monitor ended abnormally");
                }
            }
            let mut result = Ok(());
            for pool in pools.current.into_iter().chain(pools.retired) {
                if let Err(error) = pool.join().await {
                    result = Err(error);
                }
            }
            result
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(result) => {
                info!(processor = inner.processor.name(), "processor engine stopped");
                result
            },
            Err(_elapsed) => {
                error!(
                    processor = inner.processor.name(),
                    live_workers = self.stats().live_workers,
                    "shutdown timed out with workers still running"
                );
                Err(ProcessorError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Current counters.
    pub fn stats(&self) -> EngineStats {
        let shared = &self.inner.shared;
        EngineStats {
            live_workers: shared.counters.live_workers.load(Ordering::Acquire),
            generation: shared.current_generation(),
            iterations: shared.counters.iterations.load(Ordering::Relaxed),
            processed: shared.counters.processed.load(Ordering::Relaxed),
            idle_iterations: shared.counters.idle_iterations.load(Ordering::Relaxed),
            failed_iterations: shared.counters.failed_iterations.load(Ordering::Relaxed),
        }
    }

    /// Policy currently applied.
    pub fn policy(&self) -> Arc<ProcessorPolicy> {
        self.inner.shared.policy()
    }

    /// Rate limiter shared by the workers.
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.inner.shared.limiter.clone()
    }
}

impl Drop for ProcessorEngine {
    fn drop(&mut self) {
        if !self.inner.cancellation_token.is_cancelled() {
            warn!(
                processor = self.inner.processor.name(),
                "processor engine dropped without shutdown, cancelling workers"
            );
            self.inner.cancellation_token.cancel();
        }
    }
}

/// Applies policy changes on notification and on a fixed interval.
async fn monitor(inner: Arc<EngineInner>, mut changes: broadcast::Receiver<ConfigChange>) {
    let mut listening = true;
    let mut ticker = tokio::time::interval(inner.config.monitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = inner.cancellation_token.cancelled() => break,
            _ = ticker.tick() => inner.reconfigure().await,
            change = changes.recv(), if listening => match change {
                Ok(change) => {
                    debug!(
                        processor = inner.processor.name(),
                        changed_keys = ?change.previous.changed_keys(&change.current),
                        "configuration change received"
                    );
                    inner.reconfigure().await;
                },
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "configuration notifications lagged");
                    inner.reconfigure().await;
                },
                Err(RecvError::Closed) => listening = false,
            },
        }
    }

    debug!(processor = inner.processor.name(), "policy monitor stopped");
}
