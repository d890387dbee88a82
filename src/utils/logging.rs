#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_FILE: &str = "./ahvtools.log";

/// Opens `path` for appending, creating it with mode 0640.
pub fn open_append(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.append(true).create(true);
    #[cfg(unix)]
    {
        opts.mode(0o640);
    }
    opts.open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

/// Logs to stderr and, when `log_file` is set, appends the same events to it.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// whole run.
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .without_time();

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_append(path)?);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();
    Ok(guard)
}
