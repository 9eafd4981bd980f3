//! Logging bootstrap for the gatewatch binary
//!
//! Everything goes to a daily rolling file. The CLI can additionally mirror
//! events to stderr (`--verbose`), which is handy for `gatewatch watch` where
//! the operator is already looking at the terminal.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Environment variable that overrides the default log filter.
pub const LOG_ENV_VAR: &str = "GATEWATCH_LOG";

/// File name prefix for the rolling log files.
pub const LOG_FILE_PREFIX: &str = "gatewatch.log";

const DEFAULT_FILTER: &str = "gatewatch=info,gatewatch_client=info,warn";

/// Where and how verbosely to log.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Directory for the rolling files. `None` uses [`default_log_directory`].
    pub directory: Option<PathBuf>,

    /// Mirror log events to stderr as well as the file.
    pub stderr: bool,
}

impl LogConfig {
    /// Directory the log files land in.
    pub fn log_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(default_log_directory)
    }
}

/// `<data dir>/gatewatch/logs`, or `./gatewatch/logs` when the platform has
/// no data directory.
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatewatch")
        .join("logs")
}

/// Filter from `GATEWATCH_LOG`, or info for our crates and warn elsewhere.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX))
}

/// Install the global `tracing` subscriber.
///
/// # Examples
/// ```bash
/// GATEWATCH_LOG=debug gatewatch watch
/// GATEWATCH_LOG=gatewatch_client=trace gatewatch --verbose call health
/// ```
pub fn init(config: &LogConfig) -> Result<()> {
    let log_dir = config.log_directory();
    let appender = file_appender(&log_dir)?;

    let file_layer = fmt::layer()
        .with_writer(appender)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ));

    let stderr_layer = config.stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .init();

    tracing::info!(
        "gatewatch {} logging to {}",
        env!("CARGO_PKG_VERSION"),
        log_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directory_is_under_gatewatch() {
        let config = LogConfig::default();
        assert!(config.log_directory().ends_with("gatewatch/logs"));
    }

    #[test]
    fn test_explicit_directory_wins() {
        let config = LogConfig {
            directory: Some(PathBuf::from("/var/log/gw")),
            stderr: true,
        };
        assert_eq!(config.log_directory(), PathBuf::from("/var/log/gw"));
    }

    #[test]
    fn test_file_appender_creates_missing_directory() {
        let base = std::env::temp_dir().join(format!("gatewatch-logs-{}", std::process::id()));
        let nested = base.join("a").join("b");
        let _ = std::fs::remove_dir_all(&base);

        file_appender(&nested).unwrap();
        assert!(nested.is_dir());

        let _ = std::fs::remove_dir_all(&base);
    }
}
