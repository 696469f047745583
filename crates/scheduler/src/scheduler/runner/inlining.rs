use std::sync::Arc;

use throttle_core::SchedulerError;
use tracing::{debug, trace, warn};

use crate::scheduler::unit::WorkUnit;

use super::core::Shared;
use super::execution::WorkerContext;
use super::Scheduler;

impl Shared {
    /// Remove `unit` from the pending queue by identity.
    fn remove_queued(&self, unit: &Arc<WorkUnit>) -> bool {
        let mut state = self.state.lock();
        match state.queue.iter().position(|queued| Arc::ptr_eq(queued, unit)) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }

    pub(super) fn try_dequeue(&self, unit: &Arc<WorkUnit>) -> bool {
        let removed = self.remove_queued(unit);
        if removed {
            self.metrics.write().units_dequeued += 1;
        }
        removed
    }

    pub(super) fn try_inline(
        &self,
        ctx: &WorkerContext,
        unit: &Arc<WorkUnit>,
        was_previously_queued: bool,
    ) -> bool {
        if !std::ptr::eq(Arc::as_ptr(&ctx.shared), self) {
            debug!(unit = unit.name(), "refusing inline: context belongs to another scheduler");
            return false;
        }

        // A queued unit may only be inlined once it is out of the queue.
        // Failing to remove it means a worker already took it. The removal is
        // attempted either way so an inlined unit never lingers in the queue.
        let removed = self.remove_queued(unit);
        if was_previously_queued && !removed {
            trace!(unit = unit.name(), "inline skipped: unit no longer queued");
            return false;
        }

        match unit.execute(ctx) {
            Some(run) => {
                trace!(unit = unit.name(), worker_id = ctx.worker_id(), "unit inlined");
                self.metrics
                    .write()
                    .record_execution(run.duration, true, run.failed);
                true
            }
            None => false,
        }
    }
}

impl Scheduler {
    /// Run `unit` synchronously on the calling worker thread, bypassing the queue.
    ///
    /// `ctx` must come from a worker loop of this scheduler, otherwise nothing
    /// runs and the caller should [`submit`](Self::submit) instead. When
    /// `was_previously_queued` is set the unit is first removed from the
    /// pending queue; if that fails it is already owned by another worker and
    /// is left alone. Returns true iff the unit executed here.
    ///
    /// A unit never runs twice: a failed removal is not followed by an inline
    /// execution, and a unit whose job has already been claimed is skipped.
    pub fn try_inline(
        &self,
        ctx: &WorkerContext,
        unit: &Arc<WorkUnit>,
        was_previously_queued: bool,
    ) -> bool {
        self.shared.try_inline(ctx, unit, was_previously_queued)
    }

    /// Remove `unit` from the pending queue. True iff it was there.
    pub fn try_dequeue(&self, unit: &Arc<WorkUnit>) -> bool {
        self.shared.try_dequeue(unit)
    }

    /// Point-in-time copy of the pending queue, for diagnostics.
    ///
    /// Waits at most the configured snapshot timeout for the lock and fails
    /// with [`SchedulerError::Busy`] rather than stalling producers or workers.
    pub fn snapshot_queue(&self) -> Result<Vec<Arc<WorkUnit>>, SchedulerError> {
        let timeout = self.shared.snapshot_timeout;
        match self.shared.state.try_lock_for(timeout) {
            Some(state) => Ok(state.queue.iter().cloned().collect()),
            None => {
                warn!(scheduler = %self.shared.id, ?timeout, "queue snapshot timed out");
                Err(SchedulerError::Busy(timeout))
            }
        }
    }
}
