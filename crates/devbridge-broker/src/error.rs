use thiserror::Error;

/// Top-level error type for the `devbridge-broker` crate.
///
/// Covers every failure mode of the broker layer: connection lifecycle,
/// topic construction, response correlation, and payload encoding.
/// `devbridge-core` wraps these into its own error type.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// The initial connection could not be established within the
    /// configured attempt budget.
    #[error("Cannot connect to broker at {host}:{port} after {attempts} attempts")]
    ConnectAttemptsExhausted {
        host: String,
        port: u16,
        attempts: u32,
    },

    /// Publishing or subscribing while the link is down. Never queued.
    #[error("Not connected to broker")]
    NotConnected,

    /// Request rejected by the underlying MQTT client (request queue closed).
    #[error("Broker client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The client has been shut down.
    #[error("Broker client closed")]
    Closed,

    // ── Topics ──────────────────────────────────────────────────────
    /// A topic, topic segment, or subscription filter failed validation.
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    // ── Correlation ─────────────────────────────────────────────────
    /// No response arrived before the command's deadline.
    #[error("Command {id} timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },

    /// A pending response with this command id is already registered.
    #[error("Command id {0} is already awaiting a response")]
    DuplicateCommandId(String),

    /// The pending entry was dropped without a resolution.
    #[error("Response for command {0} was dropped")]
    ResponseDropped(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON encoding or decoding failed.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_topic(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure is tied to broker reachability rather than
    /// to the request itself.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectAttemptsExhausted { .. } | Self::NotConnected | Self::Client(_) | Self::Closed
        )
    }
}
