pub mod scheduler;

pub use scheduler::{
    ExecutionSubstrate, ManualSubstrate, RayonSubstrate, Scheduler, SchedulerMetrics, Task,
    ThreadSubstrate, TokioSubstrate, UnitError, UnitStatus, WorkUnit, WorkerContext,
};
pub use throttle_core::{SchedulerConfig, SchedulerError, SubstrateKind};
