//! Structured logging for the orchestration engine.
//!
//! Log levels:
//! - ERROR: Failures that stop the orchestration loop
//! - WARN: Rejected transitions, escalations, circuits opening
//! - INFO: Task lifecycle milestones (delegated, completed, abandoned)
//! - DEBUG: Routing candidates, gate details, retry scheduling
//! - TRACE: Ledger appends and report bookkeeping
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Initialize logging to ~/.conductor/conductor.log
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    set_level(if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        let _ = std::fs::create_dir_all(&dir);
        init_at(&dir.join("conductor.log"));
    }
}

/// Log to an explicit file instead of the home directory.
///
/// The first successful call wins; later calls are ignored.
pub fn init_at(path: &Path) {
    // Truncate file on startup
    if std::fs::write(path, "").is_ok() {
        LOG_PATH.set(path.to_path_buf()).ok();
    }
}

/// Set the minimum log level for output.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current log level.
pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_log_level_as_str() {
        assert_eq!(LogLevel::Error.as_str(), "ERROR");
        assert_eq!(LogLevel::Trace.as_str(), "TRACE");
    }

    #[test]
    fn test_log_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Debug);
        assert_eq!(LogLevel::from_u8(255), LogLevel::Trace);
    }

    #[test]
    fn test_log_at_without_init_is_noop() {
        // No path configured in this process: must not panic
        log_at(LogLevel::Error, "nothing to see");
        clog_debug!("formatted {}", 42);
    }
}
