//! Conditional logging macros gated by a module-level `ENABLE_LOGS` flag.
//!
//! Modules that want them define the flag and import the macros from the
//! crate root:
//! ```rust
//! const ENABLE_LOGS: bool = true;
//!
//! use retrace::{log_error, log_info, log_warn};
//! ```

/// Info-level logging, skipped when the calling module sets
/// `ENABLE_LOGS` to `false`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Warn-level logging, skipped when the calling module sets
/// `ENABLE_LOGS` to `false`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Error-level logging, skipped when the calling module sets
/// `ENABLE_LOGS` to `false`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
