//! Scheduler runner -- queue, worker loops and inlining.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructors, shared state and introspection
//! - `execution`: submit, the worker loop and the worker context
//! - `inlining`: inline execution, dequeue and queue snapshots

mod core;
mod execution;
mod inlining;
#[cfg(test)]
mod tests;

pub use self::core::Scheduler;
pub use self::execution::WorkerContext;
