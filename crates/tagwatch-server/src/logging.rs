//! Tracing subscriber setup.
//!
//! Production writes JSON to a daily rolling file and compact lines to stdout
//! (journald adds its own timestamps). Development writes pretty output with
//! span open/close events. The filter comes from `RUST_LOG`, else
//! `TAGWATCH_LOG_LEVEL`, else `info`.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the fallback filter directive.
pub const LOG_LEVEL_ENV: &str = "TAGWATCH_LOG_LEVEL";

const DEFAULT_DIRECTIVE: &str = "info";
const LOG_FILE_PREFIX: &str = "tagwatch.log";

// Dropping a guard stops its writer thread, so they live for the whole process.
static GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber.
///
/// In production `log_dir` receives `tagwatch.log.YYYY-MM-DD` files; it is
/// ignored otherwise.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid, the log directory
/// cannot be created, or a subscriber is already installed.
pub fn init(production: bool, log_dir: &Path) -> anyhow::Result<()> {
    let filter = filter()?;

    if production {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
        let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
        let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(file_writer),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .without_time()
                    .with_ansi(false)
                    .with_writer(stdout_writer),
            )
            .try_init()?;

        let _ = GUARDS.set(vec![file_guard, stdout_guard]);
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

fn filter() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive =
        std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| DEFAULT_DIRECTIVE.to_string());
    EnvFilter::try_new(&directive).with_context(|| format!("invalid {LOG_LEVEL_ENV}: {directive}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_parse() {
        assert!(EnvFilter::try_new("info,tagwatch_core::connection=debug").is_ok());
        assert!(filter().is_ok());
    }

    #[test]
    fn test_second_init_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        // Another test may already have installed a subscriber; either way the
        // second call must fail instead of panicking.
        let _ = init(false, dir.path());
        assert!(init(false, dir.path()).is_err());
    }
}
