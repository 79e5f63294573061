//! Structured logging utilities for arck components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use arck_config::log_lease_debug;
//!
//! log_lease_debug!("Lease granted", ino = 42, tgid = 3);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CHT: &'static str = "CHT";
    pub const LEASE: &'static str = "LEASE";
    pub const INODE: &'static str = "INODE";
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
    /// Map a `-v` count to a level (0 = warn)
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

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

// === CHT logging macros ===

#[macro_export]
macro_rules! log_cht_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CHT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cht_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CHT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cht_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "CHT", $($key = $value,)* $msg)
    };
}

// === LEASE logging macros ===

#[macro_export]
macro_rules! log_lease_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "LEASE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_lease_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "LEASE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_lease_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LEASE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_lease_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "LEASE", $($key = $value,)* $msg)
    };
}

// === INODE logging macros ===

#[macro_export]
macro_rules! log_inode_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "INODE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_inode_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "INODE", $($key = $value,)* $msg)
    };
}

// === CTL logging macros ===

#[macro_export]
macro_rules! log_ctl_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "CTL", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_ctl_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CTL", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
