//! Process-wide tracing setup for fanout binaries.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the tracing filter directives, e.g. `fanout_dispatch=debug`.
pub const LOG_ENV: &str = "FANOUT_LOG";
/// When set, logs are written to `<dir>/fanout.log` instead of stderr.
pub const LOG_DIR_ENV: &str = "FANOUT_LOG_DIR";

const DEFAULT_DIRECTIVES: &str = "warn";

/// Keeps the non-blocking file writer alive. Dropping it flushes pending log lines, so hold on to
/// it until the process exits.
#[must_use]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the global tracing subscriber.
pub fn init() -> anyhow::Result<LoggingGuard> {
    let log_dir = std::env::var_os(LOG_DIR_ENV).map(PathBuf::from);

    let file_guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::never(dir, "fanout.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_thread_names(true)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
            None
        }
    };

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
