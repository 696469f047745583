use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("pending queue busy: lock not acquired within {0:?}")]
    Busy(Duration),

    #[error("execution substrate error: {0}")]
    Substrate(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl SchedulerError {
    /// True for errors a caller may retry (currently only [`SchedulerError::Busy`]).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Busy(_))
    }
}
