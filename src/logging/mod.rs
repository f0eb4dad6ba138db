//! Logging infrastructure - structured tracing for declarations, calls and closures
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log level, overridable through `RUST_LOG`
//! - Zero-cost when disabled
//! - Optional JSON output and file output
//!
//! Nothing here is initialized implicitly; a host calls `init()` once if it
//! wants the events.

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path; console when `None`
    pub log_path: Option<String>,
    /// JSON lines instead of human-readable output
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // CFFI_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("CFFI_LOG_LEVEL") {
            config.level = parse_level(&level).unwrap_or(Level::INFO);
        }

        // CFFI_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("CFFI_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("CFFI_LOG_JSON").is_ok();
        config.show_spans = std::env::var("CFFI_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for debugging marshaling problems
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

pub fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration. Only the first call has
/// an effect; a subscriber installed by the host wins over ours.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("cffi_core={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let output = match config.log_path.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
                let file = path.file_name().unwrap_or(path.as_os_str());
                let appender = tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), file);
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_span_events(span_events)
                    .with_target(true)
                    .boxed()
            }
            None if config.json_format => fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_span_events(span_events)
                .boxed(),
            None => fmt::layer()
                .with_writer(io::stderr)
                .with_span_events(span_events)
                .with_target(true)
                .with_line_number(cfg!(debug_assertions))
                .boxed(),
        };

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(output)
            .try_init();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Domain events
// ============================================================================

/// Log a native call about to be made
#[inline]
pub fn log_ffi_call(function: &str, arg_count: usize, variadic: bool) {
    use tracing::trace;
    trace!(
        event = "ffi_call",
        function = function,
        args = arg_count,
        variadic = variadic,
        "native call"
    );
}

/// Log a native call that failed on our side of the boundary
pub fn log_ffi_error(function: &str, error: &str) {
    use tracing::debug;
    debug!(
        event = "ffi_error",
        function = function,
        error = error,
        "native call failed"
    );
}

/// Log a freshly prepared call descriptor
pub fn log_descriptor_prepared(signature: &str, nargs: usize, cached: bool) {
    use tracing::debug;
    debug!(
        event = "descriptor_prepared",
        signature = signature,
        args = nargs,
        cached = cached,
        "call descriptor prepared"
    );
}

pub fn log_closure_bound(signature: &str, code: *const std::ffi::c_void) {
    use tracing::debug;
    debug!(
        event = "closure_bound",
        signature = signature,
        code = ?code,
        "callback trampoline allocated"
    );
}

pub fn log_closure_teardown(code: *const std::ffi::c_void, weak_refs: usize) {
    use tracing::debug;
    debug!(
        event = "closure_teardown",
        code = ?code,
        weak_refs = weak_refs,
        "callback trampoline released"
    );
}

/// Log a host error parked while native code was on the stack
pub fn log_callback_error(error: &str) {
    use tracing::warn;
    warn!(
        event = "callback_error",
        error = error,
        "callback failed inside native code"
    );
}

pub fn log_scope_commit(count: usize) {
    use tracing::debug;
    debug!(event = "scope_commit", declarations = count, "declarations committed");
}

pub fn log_scope_discard(count: usize) {
    use tracing::debug;
    debug!(event = "scope_discard", declarations = count, "staged declarations discarded");
}

pub fn log_fill_skipped(record: &str, error: &str) {
    use tracing::warn;
    warn!(event = "record_fill_skipped", record = record, error = error, "staged record fill not applied");
}

/// Log a library opened as a symbol resolver
pub fn log_library_loaded(name: &str) {
    use tracing::info;
    info!(event = "library_loaded", library = name, "library loaded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.log_path.is_none());

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
        assert!(debug_config.show_spans);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init(); // Should not panic
        assert!(is_initialized());
    }
}
