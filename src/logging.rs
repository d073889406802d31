//! Log output setup.
//!
//! `RUST_LOG` takes precedence; otherwise `info`, or `debug` when requested.
//! With a log file configured, output goes to that file through a
//! non-blocking writer instead of stderr.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// The default filter directive.
pub fn default_level(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Install the global subscriber.
///
/// The returned guard flushes the log file when dropped and must be kept
/// alive for the lifetime of the process.
pub fn init(debug: bool, logfile: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(debug)));

    match logfile {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(io::Error::other)?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(io::Error::other)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level() {
        assert_eq!(default_level(false), "info");
        assert_eq!(default_level(true), "debug");
    }

    #[test]
    fn test_unwritable_logfile_is_reported() {
        let err = init(false, Some(Path::new("/nonexistent/dir/plantgw.log"))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
