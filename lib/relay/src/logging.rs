//! Thin wrapper around `slog`/`sloggers`: the rest of the crate logs through
//! the re-exported macros and a `Logger` built here from the configuration.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use crate::config::{ConfigError, LogConfig, SinkKind};
use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root logger for the configured sink and level.
pub fn init(cfg: &LogConfig) -> Result<Logger, ConfigError> {
    let level = severity(&cfg.level)
        .ok_or_else(|| ConfigError::Log(format!("unknown log level: {}", cfg.level)))?;

    let logger = match cfg.sink {
        SinkKind::Stdout => TerminalLoggerBuilder::new()
            .level(level)
            .destination(Destination::Stdout)
            .build(),
        SinkKind::File => {
            let path = cfg
                .file
                .as_ref()
                .ok_or_else(|| ConfigError::Log("file sink without a file path".to_string()))?;
            FileLoggerBuilder::new(path).level(level).build()
        }
    };

    logger.map_err(|err| ConfigError::Log(err.to_string()))
}

fn severity(name: &str) -> Option<Severity> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(Severity::Trace),
        "debug" => Some(Severity::Debug),
        "info" => Some(Severity::Info),
        "warn" | "warning" => Some(Severity::Warning),
        "error" => Some(Severity::Error),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}

/// A logger that drops everything, for tests and for components that were
/// handed no parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
