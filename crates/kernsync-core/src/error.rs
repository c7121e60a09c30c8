//! Recoverable errors.
//!
//! Only conditions a caller is expected to handle are represented here.
//! Contract violations (stale handles, unbalanced releases, teardown with
//! queued work) are fatal and go through [`kassert!`](crate::kassert).

use thiserror::Error;

use crate::percpu::CpuId;

/// Errors returned by kernsync operations.
#[derive(Debug, Error)]
pub enum KernSyncError {
    /// A non-blocking allocation found no memory available.
    #[error("{cache}: object cache exhausted ({})", exhausted_cause(.limit))]
    Exhausted {
        cache: &'static str,
        /// Live-object budget in force, `None` for injected failures and
        /// memory pressure.
        limit: Option<usize>,
    },
    /// The global subsystem was initialised twice.
    #[error("subsystem already initialised")]
    AlreadyInitialized,
    /// A global entry point ran before init or after fini.
    #[error("subsystem not initialised")]
    NotInitialized,
    /// A CPU index outside the configured range.
    #[error("{cpu} out of range (ncpu {ncpu})")]
    InvalidCpu { cpu: CpuId, ncpu: usize },
    /// A configuration value could not be used.
    #[error("invalid value {value:?} for {var}")]
    InvalidConfig { var: &'static str, value: String },
    /// A softint drain thread could not be started.
    #[error("failed to spawn softint thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

fn exhausted_cause(limit: &Option<usize>) -> String {
    match limit {
        Some(n) => format!("limit {n}"),
        None => "injected failure or memory pressure".to_string(),
    }
}

/// Result alias for kernsync operations.
pub type Result<T> = std::result::Result<T, KernSyncError>;

impl KernSyncError {
    /// True for the resource-exhaustion class a caller may retry.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
