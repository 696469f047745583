//! Execution substrates: where worker loops actually run.
//!
//! The scheduler never owns threads. It asks an [`ExecutionSubstrate`] to run
//! each worker loop "somewhere, soon" and returns immediately. Implementations
//! must not run the task synchronously on the caller's thread, otherwise the
//! active worker accounting breaks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use throttle_core::{SchedulerConfig, SchedulerError, SubstrateKind};
use tracing::debug;

/// A unit of substrate work: one worker loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Capability to run a closure on some thread without blocking the caller.
pub trait ExecutionSubstrate: Send + Sync {
    /// Hand `task` off for execution. Must return without running it inline.
    ///
    /// On `Err` the task must have been dropped, not run. A substrate that
    /// accepts a task and later discards it must drop it rather than leak it.
    fn run(&self, task: Task) -> Result<(), SchedulerError>;

    /// Short name for logging and metrics.
    fn name(&self) -> &str;
}

/// Build the substrate selected by `config`.
pub fn from_config(config: &SchedulerConfig) -> Result<Arc<dyn ExecutionSubstrate>, SchedulerError> {
    let substrate: Arc<dyn ExecutionSubstrate> = match config.substrate {
        SubstrateKind::Rayon => Arc::new(RayonSubstrate::new(config.resolved_pool_threads())?),
        SubstrateKind::Thread => Arc::new(ThreadSubstrate::new()),
        SubstrateKind::Tokio => Arc::new(TokioSubstrate::current()?),
    };
    Ok(substrate)
}

// ── Rayon ─────────────────────────────────────────────────────

/// Runs worker loops on a rayon thread pool.
pub struct RayonSubstrate {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl RayonSubstrate {
    /// Dedicated pool with `num_threads` threads.
    pub fn new(num_threads: usize) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("throttle-rayon-{i}"))
            .build()
            .map_err(|e| SchedulerError::Substrate(format!("failed to build rayon pool: {e}")))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Share the global rayon pool.
    pub fn global() -> Self {
        Self { pool: None }
    }
}

impl ExecutionSubstrate for RayonSubstrate {
    fn run(&self, task: Task) -> Result<(), SchedulerError> {
        match &self.pool {
            Some(pool) => pool.spawn(task),
            None => rayon::spawn(task),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "rayon"
    }
}

// ── OS threads ────────────────────────────────────────────────

/// Spawns a fresh named OS thread per worker loop.
#[derive(Default)]
pub struct ThreadSubstrate {
    spawned: AtomicUsize,
}

impl ThreadSubstrate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionSubstrate for ThreadSubstrate {
    fn run(&self, task: Task) -> Result<(), SchedulerError> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("throttle-worker-{n}"))
            .spawn(task)
            .map(drop)
            .map_err(|e| SchedulerError::Substrate(format!("failed to spawn worker thread: {e}")))
    }

    fn name(&self) -> &str {
        "thread"
    }
}

// ── Tokio ─────────────────────────────────────────────────────

/// Runs worker loops on a tokio runtime's blocking pool.
pub struct TokioSubstrate {
    handle: tokio::runtime::Handle,
}

impl TokioSubstrate {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running inside.
    pub fn current() -> Result<Self, SchedulerError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| SchedulerError::Substrate(format!("no tokio runtime: {e}")))
    }
}

impl ExecutionSubstrate for TokioSubstrate {
    fn run(&self, task: Task) -> Result<(), SchedulerError> {
        // Worker loops block on unit execution, so they belong on the blocking pool.
        // A runtime that is shutting down drops the task instead of running it.
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }

    fn name(&self) -> &str {
        "tokio"
    }
}

// ── Manual ────────────────────────────────────────────────────

/// Deterministic substrate: tasks wait until the owner runs them.
///
/// Used by tests to drive worker loops step by step on the test thread.
#[derive(Default)]
pub struct ManualSubstrate {
    tasks: Mutex<VecDeque<Task>>,
}

impl ManualSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks handed over but not yet run.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run the oldest pending task. Returns false if there was none.
    pub fn run_next(&self) -> bool {
        // Pop before running: the task may hand new tasks to this substrate.
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until none are pending, including ones queued meanwhile.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        debug!(ran, "manual substrate drained");
        ran
    }
}

impl ExecutionSubstrate for ManualSubstrate {
    fn run(&self, task: Task) -> Result<(), SchedulerError> {
        self.tasks.lock().push_back(task);
        Ok(())
    }

    fn name(&self) -> &str {
        "manual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn manual_runs_in_order_and_only_on_demand() {
        let substrate = ManualSubstrate::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            substrate.run(Box::new(move || log.lock().push(i))).unwrap();
        }
        assert_eq!(substrate.pending(), 3);
        assert!(log.lock().is_empty(), "run() must not execute inline");

        assert!(substrate.run_next());
        assert_eq!(*log.lock(), vec![0]);
        assert_eq!(substrate.run_all(), 2);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(!substrate.run_next());
    }

    fn assert_runs_elsewhere(substrate: &dyn ExecutionSubstrate) {
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        substrate
            .run(Box::new(move || {
                tx.send(std::thread::current().id()).unwrap();
            }))
            .unwrap();
        let runner = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(runner, caller);
    }

    #[test]
    fn thread_substrate_runs_on_another_thread() {
        assert_runs_elsewhere(&ThreadSubstrate::new());
    }

    #[test]
    fn rayon_substrate_runs_on_pool() {
        let substrate = RayonSubstrate::new(2).unwrap();
        assert_eq!(substrate.name(), "rayon");
        assert_runs_elsewhere(&substrate);
        assert_runs_elsewhere(&RayonSubstrate::global());
    }

    #[test]
    fn tokio_substrate_requires_runtime() {
        assert!(matches!(
            TokioSubstrate::current(),
            Err(SchedulerError::Substrate(_))
        ));
    }

    #[test]
    fn from_config_builds_selected_kind() {
        let config = SchedulerConfig {
            substrate: SubstrateKind::Thread,
            ..SchedulerConfig::default()
        };
        assert_eq!(from_config(&config).unwrap().name(), "thread");

        let config = SchedulerConfig {
            substrate: SubstrateKind::Rayon,
            pool_threads: 2,
            ..SchedulerConfig::default()
        };
        assert_eq!(from_config(&config).unwrap().name(), "rayon");
    }
}
