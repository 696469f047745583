use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace, warn};

use crate::scheduler::unit::{UnitStatus, WorkUnit};

use super::core::Shared;
use super::Scheduler;

/// Proof that the caller is running inside a worker loop.
///
/// Created by the worker loop and lent to every unit it executes, including
/// units inlined from within them. Only a holder of a context may inline work,
/// which replaces an ambient "am I a worker thread" flag with an explicit value
/// that travels down the call stack.
pub struct WorkerContext {
    pub(super) shared: Arc<Shared>,
    worker_id: u64,
}

impl WorkerContext {
    /// Sequence number of the worker loop, unique per scheduler.
    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Handle to the scheduler running this worker loop.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether this context belongs to a worker loop of `scheduler`.
    pub fn belongs_to(&self, scheduler: &Scheduler) -> bool {
        Arc::ptr_eq(&self.shared, &scheduler.shared)
    }

    /// Inline `unit` on this thread if possible. See [`Scheduler::try_inline`].
    pub fn try_inline(&self, unit: &Arc<WorkUnit>, was_previously_queued: bool) -> bool {
        self.shared.try_inline(self, unit, was_previously_queued)
    }

    /// Wait for a unit previously submitted to this context's scheduler.
    ///
    /// If the unit is still queued it is pulled out and run right here, so a
    /// unit waiting on its children cannot starve the worker slots it holds.
    /// Otherwise another worker owns it and this blocks until it finishes.
    pub fn run_or_wait(&self, unit: &Arc<WorkUnit>) -> UnitStatus {
        if !self.try_inline(unit, true) {
            trace!(unit = unit.name(), worker_id = self.worker_id, "unit claimed elsewhere, waiting");
        }
        unit.wait()
    }
}

impl Scheduler {
    /// Queue `unit` and launch a worker loop if fewer than the bound are alive.
    ///
    /// Never waits for the unit to run. Outcomes are observed through the
    /// unit itself ([`WorkUnit::wait`], [`WorkUnit::status`]).
    pub fn submit(&self, unit: Arc<WorkUnit>) {
        trace!(unit = unit.name(), id = %unit.id(), "unit submitted");

        let launch = {
            let mut state = self.shared.state.lock();
            state.queue.push_back(unit);
            if state.active_workers < self.shared.max_degree {
                state.active_workers += 1;
                state.peak_active_workers = state.peak_active_workers.max(state.active_workers);
                let worker_id = state.next_worker_id;
                state.next_worker_id += 1;
                Some(worker_id)
            } else {
                None
            }
        };

        {
            let mut metrics = self.shared.metrics.write();
            metrics.units_submitted += 1;
            if launch.is_some() {
                metrics.workers_launched += 1;
            }
        }

        if let Some(worker_id) = launch {
            debug!(scheduler = %self.shared.id, worker_id, "launching worker loop");
            let launch = WorkerLaunch {
                shared: Some(Arc::clone(&self.shared)),
                worker_id,
            };
            // A rejected task has already been dropped, which freed its slot.
            if let Err(e) = self.shared.substrate.run(Box::new(move || launch.run())) {
                warn!(scheduler = %self.shared.id, worker_id, error = %e, "substrate rejected worker loop");
            }
        }
    }

    /// Wrap `f` in a [`WorkUnit`], submit it and return the unit.
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Arc<WorkUnit>
    where
        F: FnOnce(&WorkerContext) -> anyhow::Result<()> + Send + 'static,
    {
        let unit = WorkUnit::new(name, f);
        self.submit(Arc::clone(&unit));
        unit
    }
}

/// A reserved worker slot on its way to the substrate.
///
/// Runs the worker loop when invoked. If the substrate drops it instead
/// (rejected hand-off, runtime shutting down) the slot is given back.
struct WorkerLaunch {
    shared: Option<Arc<Shared>>,
    worker_id: u64,
}

impl WorkerLaunch {
    fn run(mut self) {
        if let Some(shared) = self.shared.take() {
            worker_loop(shared, self.worker_id);
        }
    }
}

impl Drop for WorkerLaunch {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            warn!(scheduler = %shared.id, worker_id = self.worker_id, "worker loop dropped before it started");
            shared.release_unstarted_worker();
        }
    }
}

impl Shared {
    /// Give back a slot whose worker loop never ran.
    ///
    /// Units still queued stay queued; the next `submit` finds the free slot
    /// and launches a loop that drains them.
    fn release_unstarted_worker(&self) {
        let mut state = self.state.lock();
        assert!(state.active_workers > 0, "active worker count underflow");
        state.active_workers -= 1;
        self.metrics.write().worker_launch_failures += 1;
        if state.active_workers == 0 {
            self.idle.notify_all();
        }
    }
}

/// Drain the pending queue, then retire this worker slot.
///
/// Observing an empty queue and giving up the slot happen under one lock
/// acquisition, so a concurrent `submit` either lands before the check (and is
/// popped here) or sees the freed slot and launches a new loop.
fn worker_loop(shared: Arc<Shared>, worker_id: u64) {
    let ctx = WorkerContext { shared, worker_id };
    let shared = &ctx.shared;
    debug!(scheduler = %shared.id, worker_id, "worker loop started");

    let mut executed = 0u64;
    loop {
        let unit = {
            let mut state = shared.state.lock();
            match state.queue.pop_front() {
                Some(unit) => unit,
                None => {
                    assert!(state.active_workers > 0, "active worker count underflow");
                    state.active_workers -= 1;
                    if state.active_workers == 0 {
                        shared.metrics.write().last_idle_at = Some(Utc::now());
                        shared.idle.notify_all();
                    }
                    break;
                }
            }
        };

        match unit.execute(&ctx) {
            Some(run) => {
                executed += 1;
                shared
                    .metrics
                    .write()
                    .record_execution(run.duration, false, run.failed);
            }
            None => {
                debug!(unit = unit.name(), worker_id, "skipping unit already claimed elsewhere");
                shared.metrics.write().units_skipped += 1;
            }
        }
    }

    debug!(scheduler = %shared.id, worker_id, executed, "worker loop exited");
}
