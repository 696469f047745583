pub mod config;
pub mod error;

pub use config::{SchedulerConfig, SubstrateKind};
pub use error::*;
