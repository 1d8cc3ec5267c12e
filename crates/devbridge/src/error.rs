//! CLI error types with miette diagnostics.
//!
//! Maps broker, core, and config errors into user-facing errors with
//! actionable help text and stable exit codes.

use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

use devbridge_broker::ErrorCode;
use devbridge_config::ConfigError;
use devbridge_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const REJECTED: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to broker")]
    #[diagnostic(
        code(devbridge::connection_failed),
        help(
            "Check that the broker is running and reachable.\n\
             Broker settings live in the [broker] section of the config file."
        )
    )]
    ConnectionFailed {
        #[source]
        source: devbridge_broker::Error,
    },

    #[error("Broker error: {0}")]
    #[diagnostic(code(devbridge::broker))]
    Broker(#[source] devbridge_broker::Error),

    // ── Commands ─────────────────────────────────────────────────────
    #[error("No response to command {id} within {timeout_ms}ms")]
    #[diagnostic(
        code(devbridge::timeout),
        help(
            "Is a bridge running for this instance?\n\
             Increase the wait with --timeout-ms."
        )
    )]
    Timeout { id: String, timeout_ms: u64 },

    #[error("Command rejected ({code}): {message}")]
    #[diagnostic(code(devbridge::rejected))]
    Rejected { code: ErrorCode, message: String },

    #[error("Device '{device}' not found")]
    #[diagnostic(
        code(devbridge::not_found),
        help("Run: devbridge check to list configured devices")
    )]
    DeviceNotFound { device: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(devbridge::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("{source}")]
    #[diagnostic(
        code(devbridge::config),
        help("Expected at: {path}\nOverride with --config or DEVBRIDGE_CONFIG.")
    )]
    Config {
        #[source]
        source: ConfigError,
        path: String,
    },

    #[error(transparent)]
    #[diagnostic(code(devbridge::runtime))]
    Core(CoreError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON encoding failed: {0}")]
    #[diagnostic(code(devbridge::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Broker(e) if e.is_connection() => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Rejected { .. } => exit_code::REJECTED,
            Self::DeviceNotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Config { .. } => exit_code::CONFIG,
            _ => exit_code::GENERAL,
        }
    }

    pub fn config(source: ConfigError, path: &Path) -> Self {
        Self::Config {
            source,
            path: path.display().to_string(),
        }
    }
}

// ── Library error mapping ────────────────────────────────────────────

impl From<devbridge_broker::Error> for CliError {
    fn from(err: devbridge_broker::Error) -> Self {
        match err {
            devbridge_broker::Error::Timeout { id, timeout_ms } => Self::Timeout { id, timeout_ms },
            e @ devbridge_broker::Error::ConnectAttemptsExhausted { .. } => {
                Self::ConnectionFailed { source: e }
            }
            other => Self::Broker(other),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Broker(e) => e.into(),
            CoreError::DeviceNotFound { device } => Self::DeviceNotFound {
                device: device.to_string(),
            },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            other => Self::Core(other),
        }
    }
}
