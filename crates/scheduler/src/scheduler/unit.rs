use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use super::runner::WorkerContext;

/// Error recorded when a work unit does not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum UnitError {
    #[error("unit failed: {0}")]
    Failed(String),
    #[error("unit panicked: {0}")]
    Panicked(String),
}

/// Observable lifecycle of a [`WorkUnit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UnitStatus {
    /// Not yet claimed by any worker or inliner.
    Pending,
    /// Claimed and currently executing.
    Running,
    /// Finished without error.
    Completed,
    /// Returned an error or panicked.
    Failed(UnitError),
}

impl UnitStatus {
    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed(_))
    }
}

type UnitFn = Box<dyn FnOnce(&WorkerContext) -> anyhow::Result<()> + Send + 'static>;

/// Timing of a single execution, reported back to the scheduler for metrics.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Execution {
    pub duration: Duration,
    pub failed: bool,
}

/// A once-only unit of deferred work.
///
/// Units are shared as `Arc<WorkUnit>` and compared by pointer identity. The
/// job closure sits in a one-shot slot: whichever path claims it first (a
/// worker loop or an inlining caller) runs it, every later attempt is a no-op.
/// The closure receives the [`WorkerContext`] of the loop running it, which
/// lets it submit and inline child units.
pub struct WorkUnit {
    id: Uuid,
    name: String,
    job: Mutex<Option<UnitFn>>,
    status: Mutex<UnitStatus>,
    done: Condvar,
}

impl WorkUnit {
    /// Create a new unit wrapping `f`.
    pub fn new<F>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: FnOnce(&WorkerContext) -> anyhow::Result<()> + Send + 'static,
    {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            job: Mutex::new(Some(Box::new(f))),
            status: Mutex::new(UnitStatus::Pending),
            done: Condvar::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> UnitStatus {
        self.status.lock().clone()
    }

    /// True once the job has been claimed by some execution path.
    pub fn is_claimed(&self) -> bool {
        self.job.lock().is_none()
    }

    /// Block until the unit reaches a terminal status.
    ///
    /// Waiting on a unit that is never executed blocks forever. From inside a
    /// worker loop prefer [`WorkerContext::run_or_wait`], which inlines the
    /// unit when it is still queued.
    pub fn wait(&self) -> UnitStatus {
        let mut status = self.status.lock();
        while !status.is_terminal() {
            self.done.wait(&mut status);
        }
        status.clone()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning `None`.
    ///
    /// A timeout too large to represent as a deadline (e.g. `Duration::MAX`)
    /// waits without limit.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<UnitStatus> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut status = self.status.lock();
        while !status.is_terminal() {
            if self.done.wait_until(&mut status, deadline).timed_out() {
                return status.is_terminal().then(|| status.clone());
            }
        }
        Some(status.clone())
    }

    /// Claim and run the job on the calling thread.
    ///
    /// Returns `None` when the job was already claimed elsewhere. Errors and
    /// panics from the job are contained here and recorded in the status.
    pub(crate) fn execute(&self, ctx: &WorkerContext) -> Option<Execution> {
        let job = self.job.lock().take()?;
        self.set_status(UnitStatus::Running);

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(ctx)));
        let duration = started.elapsed();

        let status = match outcome {
            Ok(Ok(())) => UnitStatus::Completed,
            Ok(Err(e)) => {
                warn!(unit = %self.name, id = %self.id, error = %e, "unit failed");
                UnitStatus::Failed(UnitError::Failed(format!("{e:#}")))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(unit = %self.name, id = %self.id, panic = %message, "unit panicked");
                UnitStatus::Failed(UnitError::Panicked(message))
            }
        };
        let failed = matches!(status, UnitStatus::Failed(_));
        self.set_status(status);

        Some(Execution { duration, failed })
    }

    fn set_status(&self, status: UnitStatus) {
        let terminal = status.is_terminal();
        *self.status.lock() = status;
        if terminal {
            self.done.notify_all();
        }
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &*self.status.lock())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
