//! Level-gated connection loggers.
//!
//! Endpoints create one [LogFilter] per connection so that a chatty client
//! can be silenced without touching the process-wide log setup. Use the
//! `logger_debug!` / `logger_info!` / `logger_warn!` / `logger_error!`
//! macros from `captains_log` against the returned filter.

use captains_log::filter::LogFilter;
use std::sync::Arc;

/// Construct a connection logger gated at `level`.
pub fn new_logger(level: log::Level) -> Arc<LogFilter> {
    let filter = LogFilter::new();
    filter.set_level(level);
    Arc::new(filter)
}

/// Re-gate an existing logger; calls below `level` are dropped.
#[inline]
pub fn set_log_level(logger: &LogFilter, level: log::Level) {
    logger.set_level(level);
}

/// Map a wire-level name (`debug | log | warn | error`) to a [log::Level].
pub fn parse_log_level(name: &str) -> Option<log::Level> {
    match name {
        "debug" => Some(log::Level::Debug),
        "log" => Some(log::Level::Info),
        "warn" => Some(log::Level::Warn),
        "error" => Some(log::Level::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("log"), Some(log::Level::Info));
        assert_eq!(parse_log_level("debug"), Some(log::Level::Debug));
        assert_eq!(parse_log_level("verbose"), None);
    }
}
