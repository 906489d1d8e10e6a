//! Log output for the `tideway` binary
//!
//! The console shows Tideway's own events at the chosen level and only
//! warnings from dependencies. A file in the logs directory keeps the full
//! trace of the current run, with dependencies capped at debug so DHT
//! chatter does not drown out peer sessions.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the per-run log inside the logs directory.
pub const LOG_FILE_NAME: &str = "tideway-last-run.log";

const OWN_TARGETS: [&str; 3] = ["tideway", "tideway_core", "tideway_web"];

/// Filter directives giving Tideway targets `level` and everything else `fallback`.
pub fn directives(level: Level, fallback: Level) -> String {
    let mut directives = fallback.to_string().to_lowercase();
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{target}={}", level.to_string().to_lowercase()));
    }
    directives
}

/// Installs the console and run-log layers as the global subscriber.
///
/// `RUST_LOG` replaces the console directives when set. The run log is
/// truncated on every start. Returns the path of the run log.
///
/// # Errors
/// - Logs directory cannot be created or the log file cannot be opened
/// - A global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    let logs_dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_dir)?;
    let log_path = logs_dir.join(LOG_FILE_NAME);
    let log_file = File::create(&log_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(console_level, Level::WARN)));
    let console = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(console_filter);

    let run_log = fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(directives(Level::TRACE, Level::DEBUG)));

    tracing_subscriber::registry()
        .with(console)
        .with(run_log)
        .try_init()?;

    tracing::debug!("Console at {}, run log at {}", console_level, log_path.display());
    Ok(log_path)
}

/// Verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    /// Lifecycle events: resolution, listeners, verified pieces
    #[default]
    Info,
    /// Peer connections, tracker announces, request log
    Debug,
    /// Every wire message
    Trace,
}

impl CliLogLevel {
    /// Converts to the matching tracing level.
    ///
    /// # Examples
    /// ```
    /// use tideway_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Debug.as_tracing_level(), tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}
