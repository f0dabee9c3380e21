//! Structured logging for debugging stagewise.
//!
//! Log levels:
//! - ERROR: Rollback failures and aborted groups
//! - WARN: Failed tasks, exhausted retries, cancellation
//! - INFO: Run, stage and group boundaries, completed tasks
//! - DEBUG: Phase transitions and collaborator details
//! - TRACE: Unused by stagewise itself; useful with `RUST_LOG` for git2/tokio
//!
//! Debug mode can be enabled with the `--debug` flag or `STAGEWISE_DEBUG=1`.
//! `RUST_LOG` overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.stagewise/stagewise.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when there is no home directory or the log file
/// cannot be created. Calling this more than once keeps the first
/// subscriber.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("STAGEWISE_DEBUG")
        .map(|v| is_truthy(&v))
        .unwrap_or(false);

    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match open_log_file() {
        Some((path, file)) => {
            let result = registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init();
            if result.is_ok() {
                LOG_PATH.set(path).ok();
            }
            result
        }
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(debug = debug_enabled, "logging initialized");
    }
}

/// Open the log file, truncated on startup.
fn open_log_file() -> Option<(PathBuf, File)> {
    let dir = dirs::home_dir()?.join(".stagewise");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("stagewise.log");
    let file = File::create(&path).ok()?;
    Some((path, file))
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "stagewise=debug,info"
    } else {
        "info"
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, when logging to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}
