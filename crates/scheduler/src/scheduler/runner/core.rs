use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use throttle_core::config::MIN_DEGREE_OF_PARALLELISM;
use throttle_core::{SchedulerConfig, SchedulerError};
use tracing::info;
use uuid::Uuid;

use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::substrate::{self, ExecutionSubstrate};
use crate::scheduler::unit::WorkUnit;

/// Everything guarded by the scheduler's single lock.
pub(super) struct State {
    /// Pending units in submission order.
    pub(super) queue: VecDeque<Arc<WorkUnit>>,
    /// Worker loops launched and not yet exited. Never exceeds the degree.
    pub(super) active_workers: usize,
    pub(super) peak_active_workers: usize,
    pub(super) next_worker_id: u64,
}

impl State {
    pub(super) fn is_idle(&self) -> bool {
        self.active_workers == 0 && self.queue.is_empty()
    }
}

/// State shared between scheduler handles and the worker loops they launch.
pub(super) struct Shared {
    pub(super) id: Uuid,
    pub(super) max_degree: usize,
    pub(super) snapshot_timeout: Duration,
    pub(super) state: Mutex<State>,
    /// Signalled when the last worker loop exits.
    pub(super) idle: Condvar,
    pub(super) substrate: Arc<dyn ExecutionSubstrate>,
    /// Lock order: `state` before `metrics`.
    pub(super) metrics: RwLock<SchedulerMetrics>,
}

/// Bounded-concurrency scheduler.
///
/// Runs submitted [`WorkUnit`]s on at most `max_degree_of_parallelism` worker
/// loops at a time. Worker loops are launched lazily on the injected
/// [`ExecutionSubstrate`] and exit as soon as the pending queue is empty.
///
/// `Scheduler` is a cheap handle; clones share the same queue and workers.
/// Dropping every handle while work is queued does not cancel anything:
/// launched worker loops keep the shared state alive and drain the queue.
/// Making sure the substrate actually runs those loops is up to the owner.
#[derive(Clone)]
pub struct Scheduler {
    pub(super) shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler bounded to `max_degree_of_parallelism` worker loops.
    ///
    /// Fails with [`SchedulerError::InvalidConfiguration`] for degrees below 2.
    pub fn new(
        max_degree_of_parallelism: usize,
        substrate: Arc<dyn ExecutionSubstrate>,
    ) -> Result<Self, SchedulerError> {
        let config = SchedulerConfig {
            max_degree_of_parallelism,
            ..SchedulerConfig::default()
        };
        Self::with_config(&config, substrate)
    }

    /// Create a scheduler from `config`, using the given substrate.
    pub fn with_config(
        config: &SchedulerConfig,
        substrate: Arc<dyn ExecutionSubstrate>,
    ) -> Result<Self, SchedulerError> {
        let max_degree = config.max_degree_of_parallelism;
        if max_degree < MIN_DEGREE_OF_PARALLELISM {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "max degree of parallelism must be at least {}, got {}",
                MIN_DEGREE_OF_PARALLELISM, max_degree
            )));
        }
        config.validate()?;

        let id = Uuid::new_v4();
        info!(
            scheduler = %id,
            max_degree,
            substrate = substrate.name(),
            "scheduler created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                max_degree,
                snapshot_timeout: config.snapshot_timeout(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    active_workers: 0,
                    peak_active_workers: 0,
                    next_worker_id: 0,
                }),
                idle: Condvar::new(),
                substrate,
                metrics: RwLock::new(SchedulerMetrics::new(max_degree)),
            }),
        })
    }

    /// Create a scheduler and the substrate selected by `config`.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let substrate = substrate::from_config(config)?;
        Self::with_config(config, substrate)
    }

    /// Unique id of this scheduler (shared by clones).
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// The immutable concurrency bound.
    pub fn max_degree_of_parallelism(&self) -> usize {
        self.shared.max_degree
    }

    /// Name of the substrate worker loops run on.
    pub fn substrate_name(&self) -> &str {
        self.shared.substrate.name()
    }

    /// Worker loops currently alive.
    pub fn active_workers(&self) -> usize {
        self.shared.state.lock().active_workers
    }

    /// Units waiting in the pending queue.
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// No worker loop alive and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().is_idle()
    }

    /// Block until the scheduler is idle or `timeout` elapses. Returns whether it is idle.
    ///
    /// Must not be called from inside a worker loop of this scheduler: the
    /// calling loop itself keeps the scheduler active. A timeout too large to
    /// represent as a deadline (e.g. `Duration::MAX`) waits without limit.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            match deadline {
                Some(deadline) => {
                    if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                        return state.is_idle();
                    }
                }
                None => self.shared.idle.wait(&mut state),
            }
        }
        true
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let state = self.shared.state.lock();
        let mut metrics = self.shared.metrics.read().clone();
        metrics.active_workers = state.active_workers;
        metrics.peak_active_workers = state.peak_active_workers;
        metrics.queue_depth = state.queue.len();
        metrics
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared.id)
            .field("max_degree", &self.shared.max_degree)
            .field("substrate", &self.shared.substrate.name())
            .finish()
    }
}
