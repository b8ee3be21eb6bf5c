//! Pool error types.

use crate::pool::MachineKey;
use runchart_core::CoreError;
use thiserror::Error;

/// Errors from the machine store and the runner pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("machine {0} is checked out")]
    Busy(MachineKey),

    #[error("no runner available: all {capacity} runners are checked out")]
    Exhausted { capacity: usize },

    #[error("no chart registered for type '{0}'")]
    UnknownChartType(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}

impl PoolError {
    /// Returns true if the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Busy(_) | PoolError::Io(_))
    }
}
