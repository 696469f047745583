//! Bounded-concurrency scheduler with lazy worker loops and inlining.
//!
//! Producers [`submit`](Scheduler::submit) [`WorkUnit`]s from any thread. The
//! scheduler keeps them in a FIFO queue and launches at most
//! `max_degree_of_parallelism` worker loops on an [`ExecutionSubstrate`];
//! each loop drains the queue and exits once it is empty. Code already
//! running inside a worker loop holds a [`WorkerContext`] and may inline a
//! unit instead of waiting for a free slot.

pub mod metrics;
pub mod runner;
pub mod substrate;
pub mod unit;

pub use metrics::SchedulerMetrics;
pub use runner::{Scheduler, WorkerContext};
pub use substrate::{
    ExecutionSubstrate, ManualSubstrate, RayonSubstrate, Task, ThreadSubstrate, TokioSubstrate,
};
pub use unit::{UnitError, UnitStatus, WorkUnit};
