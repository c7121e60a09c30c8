//! Runtime configuration.
//!
//! Read from the environment once per process:
//! - `KERNSYNC_NCPU`: number of virtual CPUs for per-CPU structures
//!   (default: `std::thread::available_parallelism()`).
//! - `KERNSYNC_SOFTINT`: softint backend, `thread` (default) runs one drain
//!   thread per CPU; `manual` leaves draining to the caller.
//! - `KERNSYNC_LOCKOBJ_LIMIT`: live-object budget for the global lock-object
//!   caches. `0` or `unlimited` (default) disables the budget.
//!
//! Unparseable values fall back to the default with a warning. Use
//! [`KernSyncConfig::try_from_lookup`] to reject them instead.

use std::sync::OnceLock;

use crate::error::{KernSyncError, Result};

pub const ENV_NCPU: &str = "KERNSYNC_NCPU";
pub const ENV_SOFTINT: &str = "KERNSYNC_SOFTINT";
pub const ENV_LOCKOBJ_LIMIT: &str = "KERNSYNC_LOCKOBJ_LIMIT";

/// Upper bound on virtual CPUs. Keeps a typo from allocating a huge table.
pub const MAX_CPUS: usize = 1024;

/// How scheduled softints get run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftIntMode {
    /// One dedicated drain thread per CPU, woken on schedule.
    #[default]
    Thread,
    /// Scheduling only marks the CPU; the owner drains explicitly.
    Manual,
}

impl SoftIntMode {
    /// Parse from string (case-insensitive). Unknown values map to `Thread`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        Self::parse(s).unwrap_or_default()
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" | "threaded" | "kthread" | "default" => Some(Self::Thread),
            "manual" | "poll" | "polled" => Some(Self::Manual),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Manual => "manual",
        }
    }
}

/// Process-wide kernsync settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernSyncConfig {
    pub ncpu: usize,
    pub softint: SoftIntMode,
    pub lockobj_limit: Option<usize>,
}

impl Default for KernSyncConfig {
    fn default() -> Self {
        Self {
            ncpu: default_ncpu(),
            softint: SoftIntMode::default(),
            lockobj_limit: None,
        }
    }
}

impl KernSyncConfig {
    /// Build from the process environment, ignoring bad values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source, ignoring bad values.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_NCPU) {
            match parse_ncpu(&raw) {
                Ok(n) => cfg.ncpu = n,
                Err(err) => log::warn!("{err}; using ncpu={}", cfg.ncpu),
            }
        }
        if let Some(raw) = lookup(ENV_SOFTINT) {
            match SoftIntMode::parse(&raw) {
                Some(mode) => cfg.softint = mode,
                None => log::warn!(
                    "invalid value {raw:?} for {ENV_SOFTINT}; using {}",
                    cfg.softint.as_str()
                ),
            }
        }
        if let Some(raw) = lookup(ENV_LOCKOBJ_LIMIT) {
            match parse_limit(&raw) {
                Ok(limit) => cfg.lockobj_limit = limit,
                Err(err) => log::warn!("{err}; lock-object budget disabled"),
            }
        }
        cfg
    }

    /// Build from an arbitrary variable source, rejecting bad values.
    pub fn try_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_NCPU) {
            cfg.ncpu = parse_ncpu(&raw)?;
        }
        if let Some(raw) = lookup(ENV_SOFTINT) {
            cfg.softint = SoftIntMode::parse(&raw).ok_or(KernSyncError::InvalidConfig {
                var: ENV_SOFTINT,
                value: raw,
            })?;
        }
        if let Some(raw) = lookup(ENV_LOCKOBJ_LIMIT) {
            cfg.lockobj_limit = parse_limit(&raw)?;
        }
        Ok(cfg)
    }

    #[must_use]
    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu.clamp(1, MAX_CPUS);
        self
    }

    #[must_use]
    pub fn with_softint(mut self, mode: SoftIntMode) -> Self {
        self.softint = mode;
        self
    }

    #[must_use]
    pub fn with_lockobj_limit(mut self, limit: Option<usize>) -> Self {
        self.lockobj_limit = limit.filter(|&n| n > 0);
        self
    }
}

fn default_ncpu() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_CPUS)
}

fn parse_ncpu(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if (1..=MAX_CPUS).contains(&n) => Ok(n),
        _ => Err(KernSyncError::InvalidConfig {
            var: ENV_NCPU,
            value: raw.to_string(),
        }),
    }
}

fn parse_limit(raw: &str) -> Result<Option<usize>> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("unlimited") || trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    trimmed
        .parse::<usize>()
        .map(|n| (n > 0).then_some(n))
        .map_err(|_| KernSyncError::InvalidConfig {
            var: ENV_LOCKOBJ_LIMIT,
            value: raw.to_string(),
        })
}

static CONFIG: OnceLock<KernSyncConfig> = OnceLock::new();

/// The process-wide configuration (reads the environment on first call).
#[must_use]
pub fn config() -> &'static KernSyncConfig {
    CONFIG.get_or_init(KernSyncConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn parse_softint_modes() {
        assert_eq!(SoftIntMode::from_str_loose("thread"), SoftIntMode::Thread);
        assert_eq!(SoftIntMode::from_str_loose("KTHREAD"), SoftIntMode::Thread);
        assert_eq!(SoftIntMode::from_str_loose("manual"), SoftIntMode::Manual);
        assert_eq!(SoftIntMode::from_str_loose(" Poll "), SoftIntMode::Manual);
        assert_eq!(SoftIntMode::from_str_loose("bogus"), SoftIntMode::Thread);
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = KernSyncConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, KernSyncConfig::default());
        assert!(cfg.ncpu >= 1);
        assert_eq!(cfg.softint, SoftIntMode::Thread);
        assert_eq!(cfg.lockobj_limit, None);
    }

    #[test]
    fn all_variables_are_read() {
        let cfg = KernSyncConfig::from_lookup(lookup(&[
            (ENV_NCPU, "3"),
            (ENV_SOFTINT, "manual"),
            (ENV_LOCKOBJ_LIMIT, "128"),
        ]));
        assert_eq!(cfg.ncpu, 3);
        assert_eq!(cfg.softint, SoftIntMode::Manual);
        assert_eq!(cfg.lockobj_limit, Some(128));
    }

    #[test]
    fn bad_values_fall_back_when_lenient() {
        let cfg = KernSyncConfig::from_lookup(lookup(&[
            (ENV_NCPU, "0"),
            (ENV_SOFTINT, "interrupts"),
            (ENV_LOCKOBJ_LIMIT, "lots"),
        ]));
        assert_eq!(cfg.ncpu, default_ncpu());
        assert_eq!(cfg.softint, SoftIntMode::Thread);
        assert_eq!(cfg.lockobj_limit, None);
    }

    #[test]
    fn bad_values_rejected_when_strict() {
        let err = KernSyncConfig::try_from_lookup(lookup(&[(ENV_NCPU, "99999")])).unwrap_err();
        assert!(matches!(err, KernSyncError::InvalidConfig { var, .. } if var == ENV_NCPU));

        let err =
            KernSyncConfig::try_from_lookup(lookup(&[(ENV_SOFTINT, "irq")])).unwrap_err();
        assert!(matches!(err, KernSyncError::InvalidConfig { var, .. } if var == ENV_SOFTINT));

        let err = KernSyncConfig::try_from_lookup(lookup(&[(ENV_LOCKOBJ_LIMIT, "-1")]))
            .unwrap_err();
        assert!(
            matches!(err, KernSyncError::InvalidConfig { var, .. } if var == ENV_LOCKOBJ_LIMIT)
        );
    }

    #[test]
    fn zero_and_unlimited_disable_budget() {
        for raw in ["0", "unlimited", "NONE"] {
            let cfg =
                KernSyncConfig::try_from_lookup(lookup(&[(ENV_LOCKOBJ_LIMIT, raw)])).unwrap();
            assert_eq!(cfg.lockobj_limit, None, "raw={raw}");
        }
    }

    #[test]
    fn builders_clamp() {
        let cfg = KernSyncConfig::default()
            .with_ncpu(0)
            .with_lockobj_limit(Some(0));
        assert_eq!(cfg.ncpu, 1);
        assert_eq!(cfg.lockobj_limit, None);
        assert_eq!(KernSyncConfig::default().with_ncpu(1 << 20).ncpu, MAX_CPUS);
    }

    #[test]
    fn cached_config_is_sticky() {
        let first = config();
        let second = config();
        assert!(std::ptr::eq(first, second));
    }
}
