//! Stress and contract harness for kernsync.
//!
//! This crate provides:
//! - Scenarios: concurrent and fault-injected runs of the lock-object
//!   allocator and the deferred-work dispatcher, each checking one contract
//! - Structured JSONL logs of every run, and a validator for them
//! - A stderr backend for the `log` facade used by the core crate

#![forbid(unsafe_code)]

pub mod error;
pub mod logger;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use scenarios::{Scenario, ScenarioParams, ScenarioReport, run_all, run_scenario};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
