//! Server diagnostics: terminal output plus an optional daily log file.
//!
//! These are the server's own logs. Device records go through the log sink.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::{DefaultFields, Format, Full};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

type FileLayer = fmt::Layer<Registry, DefaultFields, Format<Full, ChronoUtc>, NonBlocking>;

/// Level used when `RUST_LOG` is unset
const DEFAULT_DIRECTIVE: &str = "info";

static LOGGING: OnceLock<LoggingGuards> = OnceLock::new();

/// Keeps the background writer threads alive. Pending lines are flushed on drop.
pub struct LoggingGuards {
    _stdout: Mutex<WorkerGuard>,
    file: Mutex<WorkerGuard>,
    file_reload: reload::Handle<FileLayer, Registry>,
}

impl LoggingGuards {
    /// Point the file layer at another writer, releasing the old one.
    fn redirect(&self, writer: NonBlocking, guard: WorkerGuard) -> Result<(), String> {
        let mut current = self
            .file
            .lock()
            .map_err(|_| "Logging file guard lock poisoned".to_string())?;
        self.file_reload
            .modify(|layer| *layer = file_layer(writer))
            .map_err(|e| format!("Failed to reload logging file layer: {e}"))?;
        *current = guard;
        Ok(())
    }
}

fn file_layer(writer: NonBlocking) -> FileLayer {
    fmt::layer::<Registry>()
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
}

/// Writer for `{log_dir}/{name}.log.YYYY-MM-DD`, or a sink that discards
/// everything when there is no directory.
fn file_writer(
    log_dir: Option<&Path>,
    name: &str,
) -> Result<(Option<PathBuf>, (NonBlocking, WorkerGuard)), String> {
    let Some(dir) = log_dir else {
        return Ok((None, tracing_appender::non_blocking(io::sink())));
    };

    let file_name = format!("{name}.log");
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&file_name)
        .build(dir)
        .map_err(|e| format!("Failed to create log file in {dir:?}: {e}"))?;
    Ok((Some(dir.join(file_name)), tracing_appender::non_blocking(appender)))
}

/// Start logging to the terminal, and to a daily file under `log_dir` if given.
///
/// Returns the log file's path prefix. Later calls keep the terminal logger
/// and only move the file logger.
pub fn init_logging(
    log_dir: Option<&Path>,
    name: &str,
) -> Result<(Option<PathBuf>, &'static LoggingGuards), String> {
    let (log_path, (writer, guard)) = file_writer(log_dir, name)?;

    if let Some(guards) = LOGGING.get() {
        guards.redirect(writer, guard)?;
        return Ok((log_path, guards));
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVE))
        .map_err(|e| format!("Failed to set up logging env filter: {e}"))?;

    // Handler threads are named after their peer, which makes them worth showing
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(io::stdout());
    let stdout_layer = fmt::layer()
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(stdout_writer)
        .with_thread_names(true)
        .with_target(false);

    let (file_layer, file_reload) = reload::Layer::new(file_layer(writer));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {e}"))?;

    let guards = LOGGING.get_or_init(|| LoggingGuards {
        _stdout: Mutex::new(stdout_guard),
        file: Mutex::new(guard),
        file_reload,
    });
    Ok((log_path, guards))
}
