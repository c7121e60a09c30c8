//! `log` backend for the harness binary: level-tagged lines on stderr.
//!
//! The level comes from `KERNSYNC_LOG` (`error`, `warn`, `info`, `debug`,
//! `trace`, `off`), defaulting to `warn`.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

pub const ENV_LOG: &str = "KERNSYNC_LOG";

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{:>5}][{}][{}] {}",
            record.level(),
            thread.name().unwrap_or("-"),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Parse a level name. Unknown names give `None`.
#[must_use]
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "off" | "none" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Install the stderr logger. A second call is a no-op.
pub fn init() {
    static LOGGER: StderrLogger = StderrLogger;
    let level = std::env::var(ENV_LOG)
        .ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(LevelFilter::Warn);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Map a `log` level onto the structured-log level.
#[must_use]
pub fn to_log_level(level: Level) -> crate::structured_log::LogLevel {
    use crate::structured_log::LogLevel;
    match level {
        Level::Error => LogLevel::Error,
        Level::Warn => LogLevel::Warn,
        Level::Info => LogLevel::Info,
        Level::Debug => LogLevel::Debug,
        Level::Trace => LogLevel::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured_log::LogLevel;

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" warning "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("off"), Some(LevelFilter::Off));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn levels_map_onto_structured_levels() {
        assert_eq!(to_log_level(Level::Warn), LogLevel::Warn);
        assert_eq!(to_log_level(Level::Trace), LogLevel::Trace);
    }
}
