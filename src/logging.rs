//! Tracing setup: console output always, plus a daily-rotated log file for
//! long-running `service` invocations.
use crate::config::LoggingConfig;
use crate::data_dir::DataDir;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "tailguard";

/// Console verbosity chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Verbosity::Verbose
        } else if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    fn default_filter(self) -> &'static str {
        match self {
            Verbosity::Quiet => "tailguard=warn",
            Verbosity::Normal => "tailguard=info",
            Verbosity::Verbose => "tailguard=debug",
        }
    }
}

/// Directory the file layer writes to.
pub fn log_dir(logging: &LoggingConfig, data_dir: &DataDir) -> PathBuf {
    logging.dir.clone().unwrap_or_else(|| data_dir.logs())
}

/// Daily-rotated appender that keeps at most `max_files` files.
pub fn file_appender(dir: &Path, max_files: usize) -> Result<RollingFileAppender, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("log")
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| format!("cannot open log file in {}: {e}", dir.display()))
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
///
/// With `file = Some((dir, max_files))` a plain-text file layer is added.
/// The returned guard flushes that layer on drop, so hold it until exit.
pub fn init(verbosity: Verbosity, file: Option<(&Path, usize)>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_filter()));

    let mut guard = None;
    let file_layer = match file {
        Some((dir, max_files)) => match file_appender(dir, max_files) {
            Ok(appender) => {
                let (writer, flush_guard) = tracing_appender::non_blocking(appender);
                guard = Some(flush_guard);
                Some(fmt::layer().with_writer(writer).with_ansi(false))
            }
            Err(e) => {
                eprintln!("warning: {e}, logging to console only");
                None
            }
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}
