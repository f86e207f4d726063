//! Structured logging utilities for Loom components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use loom_config::logging::*;
//!
//! log_engine_info!("Filter installed", filter_id = 3);
//! log_daemon_debug!("Command received", command = "ls");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const ENGINE: &'static str = "ENGINE";
    pub const DAEMON: &'static str = "DAEMON";
    pub const CONTROLLER: &'static str = "CONTROLLER";
    pub const CTL: &'static str = "CTL";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === ENGINE logging macros ===

#[macro_export]
macro_rules! log_engine_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_engine_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_engine_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_engine_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

// === CONTROLLER logging macros ===

#[macro_export]
macro_rules! log_controller_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CONTROLLER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_controller_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CONTROLLER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_controller_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CONTROLLER", $($key = $value,)* $msg)
    };
}

// === CTL logging macros ===

#[macro_export]
macro_rules! log_ctl_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CTL", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_ctl_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CTL", $($key = $value,)* $msg)
    };
}

fn env_filter(level: LogLevel) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    EnvFilter::try_from_env("LOOM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .init();
}

/// Like [`init_logging`], but leaves an already installed subscriber alone.
///
/// The runtime is linked into someone else's program and must not fight the
/// host application over the global subscriber.
pub fn try_init_logging(level: LogLevel) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
