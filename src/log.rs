//! Structured logging for taskline.
//!
//! Everything logs through `tracing` macros with structured fields. The
//! subscriber writes to `~/.taskline/taskline.log` (or `$TASKLINE_HOME`),
//! truncated on startup.
//!
//! Level selection, first match wins:
//! - `TASKLINE_LOG` (any `EnvFilter` directive, e.g. `taskline=trace`)
//! - `--debug` flag or `TASKLINE_DEBUG=1`: debug
//! - otherwise: info

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

const LOG_FILE: &str = "taskline.log";
const FILTER_ENV: &str = "TASKLINE_LOG";
const DEBUG_ENV: &str = "TASKLINE_DEBUG";

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first subscriber is installed.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let Some(path) = log_path() else {
        return;
    };
    let Ok(file) = File::create(&path) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init();

    tracing::info!(
        path = %path.display(),
        debug = debug_enabled,
        version = env!("CARGO_PKG_VERSION"),
        "taskline logging initialized"
    );
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, creating its directory. `None` without a home dir.
pub fn log_path() -> Option<PathBuf> {
    let dir = Config::taskline_dir().ok()?;
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir.join(LOG_FILE))
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "taskline=debug,info"
    } else {
        "info"
    }
}
