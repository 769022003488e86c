//! Processors for exercising the engine.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_processor::{ProcessContext, Processor, ProcessorError, Result};

/// What [`CountingProcessor`] does when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorBehavior {
    /// Report that work was found.
    FindWork,
    /// Report that nothing was found.
    Idle,
    /// Return an error.
    Fail,
    /// Panic.
    Panic,
}

/// Processor that counts calls and tracks how many run at once.
#[derive(Debug)]
pub struct CountingProcessor {
    behavior: Mutex<ProcessorBehavior>,
    work_duration: Duration,
    calls: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    permits_per_call: u32,
}

impl CountingProcessor {
    /// Creates a processor that behaves as `behavior` and takes
    /// `work_duration` per call.
    pub fn new(behavior: ProcessorBehavior, work_duration: Duration) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            work_duration,
            calls: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            permits_per_call: 0,
        }
    }

    /// Makes every call take `permits` permits from the engine's limiter.
    #[must_use]
    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits_per_call = permits;
        self
    }

    /// Changes the behavior of later calls.
    pub fn set_behavior(&self, behavior: ProcessorBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Calls started so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to the end of their work.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls since the last reset.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Restarts peak tracking from the current level.
    pub fn reset_max_in_flight(&self) {
        self.max_in_flight.store(self.in_flight(), Ordering::SeqCst);
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Processor for CountingProcessor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn process(&self, ctx: &ProcessContext) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.permits_per_call > 0 {
            ctx.acquire_permits(self.permits_per_call).await;
        }
        if !self.work_duration.is_zero() {
            tokio::time::sleep(self.work_duration).await;
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap_or_else(PoisonError::into_inner);
        match behavior {
            ProcessorBehavior::FindWork => Ok(true),
            ProcessorBehavior::Idle => Ok(false),
            ProcessorBehavior::Fail => Err(ProcessorError::transient_claim("queue unreachable")),
            ProcessorBehavior::Panic => panic!("processor blew up"),
        }
    }
}
