// ── Core error types ──
//
// Errors surfaced by the device runtime to its embedder. Per-device
// failures (provider errors, rejected commands) never show up here; they
// travel on the wire as `ErrorObject`s instead.

use devbridge_broker::DeviceId;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Broker ───────────────────────────────────────────────────────
    #[error(transparent)]
    Broker(#[from] devbridge_broker::Error),

    // ── Devices ──────────────────────────────────────────────────────
    #[error("Device not found: {device}")]
    DeviceNotFound { device: DeviceId },

    #[error("Device declared more than once: {device}")]
    DuplicateDevice { device: DeviceId },

    #[error("Invalid parasite target for {device}: {reason}")]
    InvalidParasite { device: DeviceId, reason: String },

    #[error("Cannot generate discovery for {device}: {reason}")]
    DiscoveryGeneration { device: DeviceId, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Bridge has shut down")]
    ShutDown,
}

impl CoreError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
