use kernsync_core::KernSyncError;
use thiserror::Error;

/// Errors from harness scenarios and the CLI.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    KernSync(#[from] KernSyncError),
    /// A scenario observed behaviour that breaks a primitive's contract.
    #[error("check failed: {0}")]
    Check(String),
    #[error("worker thread panicked in {0}")]
    WorkerPanicked(&'static str),
    #[error("{invalid} of {total} log lines failed validation")]
    InvalidLog { invalid: usize, total: usize },
}

/// Fail the current scenario with a formatted message unless `cond` holds.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::HarnessError::Check(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;
