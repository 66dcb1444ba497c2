//! Call-scoped logging macros gated by a module-level `ENABLE_LOGS` flag.
//!
//! Every line is prefixed with the call session id so interleaved sessions
//! can be told apart in the log output.
//!
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{call_info, call_warn};
//!
//! call_info!(session_id, "joined room {}", room_id);
//! ```

/// Info line for a call session. The calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! call_info {
    ($session:expr, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!("[call {}] {}", $session, format_args!($($arg)*));
        }
    };
}

/// Warn line for a call session. The calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! call_warn {
    ($session:expr, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!("[call {}] {}", $session, format_args!($($arg)*));
        }
    };
}

/// Error line for a call session. The calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! call_error {
    ($session:expr, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!("[call {}] {}", $session, format_args!($($arg)*));
        }
    };
}

/// Debug line for a call session. Not gated: `RUST_LOG` already filters debug.
#[macro_export]
macro_rules! call_debug {
    ($session:expr, $($arg:tt)*) => {
        log::debug!("[call {}] {}", $session, format_args!($($arg)*));
    };
}

/// Info line without a call session. The calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Warn line without a call session. The calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}
