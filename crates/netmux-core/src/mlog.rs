//! Engine diagnostics on stderr
//!
//! Every subsystem logs through the `mux_*` macros. Each line carries
//! the level and the module that emitted it, so accept-loop noise is
//! distinguishable from registry churn at a glance:
//!
//! ```text
//! netmux warn  [listen] listener 0.0.0.0:9997: accept failed: errno 24
//! netmux debug [multiplexer] registered fd 7 as 0g0
//! ```
//!
//! The threshold is read from `NMX_LOG_LEVEL` (a name or digit,
//! `off`/`error`/`warn`/`info`/`debug`/`trace` or 0-5, default `warn`)
//! the first time anything logs. `NMX_FLUSH_LOG=1` flushes stderr after
//! every line, which helps when a crash eats buffered output. Tests
//! override both with [`set_log_level`] and [`set_flush_enabled`].

use core::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

/// Severity threshold for a log line
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse the forms `NMX_LOG_LEVEL` accepts: a level name or digit
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Fixed width keeps the subsystem column aligned
        write!(f, "{:<5}", self.name())
    }
}

struct Sink {
    level: AtomicU8,
    flush: AtomicBool,
}

static SINK: OnceLock<Sink> = OnceLock::new();

fn sink() -> &'static Sink {
    SINK.get_or_init(|| {
        let level = std::env::var("NMX_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(LogLevel::Warn);
        let flush = std::env::var("NMX_FLUSH_LOG")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Sink {
            level: AtomicU8::new(level as u8),
            flush: AtomicBool::new(flush),
        }
    })
}

/// Override the threshold (wins over the environment)
pub fn set_log_level(level: LogLevel) {
    sink().level.store(level as u8, Ordering::Relaxed);
}

/// Override per-line flushing
pub fn set_flush_enabled(enabled: bool) {
    sink().flush.store(enabled, Ordering::Relaxed);
}

/// Whether a line at `level` would currently be written
///
/// The macros check this before building their format arguments, so a
/// disabled level costs one atomic load.
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= sink().level.load(Ordering::Relaxed)
}

/// Subsystem tag for a `module_path!()` value: the last path segment
fn subsystem(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

#[doc(hidden)]
pub fn _emit(level: LogLevel, module: &str, args: fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "netmux {} [{}] {}", level, subsystem(module), args);
    if sink().flush.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Log at an explicit level, tagged with the calling module
#[macro_export]
macro_rules! mux_log {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::mlog::level_enabled(level) {
            $crate::mlog::_emit(level, module_path!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! mux_error {
    ($($arg:tt)*) => { $crate::mux_log!($crate::mlog::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! mux_warn {
    ($($arg:tt)*) => { $crate::mux_log!($crate::mlog::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! mux_info {
    ($($arg:tt)*) => { $crate::mux_log!($crate::mlog::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! mux_debug {
    ($($arg:tt)*) => { $crate::mux_log!($crate::mlog::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! mux_trace {
    ($($arg:tt)*) => { $crate::mux_log!($crate::mlog::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_digits() {
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse(" debug "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("0"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("4"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::parse(""), None);
        assert_eq!(LogLevel::parse("6"), None);
    }

    #[test]
    fn test_threshold_gates_levels() {
        set_log_level(LogLevel::Info);
        assert!(level_enabled(LogLevel::Error));
        assert!(level_enabled(LogLevel::Info));
        assert!(!level_enabled(LogLevel::Debug));

        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
    }

    #[test]
    fn test_subsystem_is_last_segment() {
        assert_eq!(subsystem("netmux::listen"), "listen");
        assert_eq!(subsystem("netmux::backend::epoll_linux"), "epoll_linux");
        assert_eq!(subsystem("mux_smoke"), "mux_smoke");
    }

    #[test]
    fn test_display_is_fixed_width() {
        assert_eq!(format!("{}", LogLevel::Warn), "warn ");
        assert_eq!(format!("{}", LogLevel::Error), "error");
    }
}
