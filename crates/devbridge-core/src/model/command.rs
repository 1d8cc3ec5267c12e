use std::time::Duration;

use chrono::{DateTime, Utc};
use strum::{Display, IntoStaticStr};

use devbridge_broker::payload::Values;
use devbridge_broker::{CommandPayload, DeviceId, ErrorObject, ResponsePayload};

/// A decoded command addressed to one local device.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub device: DeviceId,
    pub issued_at: DateTime<Utc>,
    pub values: Values,
    /// Advisory; the sender stops waiting, the bridge does not cancel.
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn from_payload(device: DeviceId, payload: CommandPayload) -> Self {
        Self {
            issued_at: payload.issued_at(),
            timeout: payload.timeout.map(Duration::from_millis),
            id: payload.id,
            device,
            values: payload.values,
        }
    }
}

/// Lifecycle of a command inside the bridge:
/// `Received → Validated → Applied → Acknowledged`, or `Received → Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum CommandPhase {
    Received,
    Validated,
    Applied,
    Acknowledged,
    Rejected,
}

/// Terminal result of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Applied; carries the device's fresh values.
    Acknowledged { values: Values },
    Rejected(ErrorObject),
}

impl CommandOutcome {
    pub fn phase(&self) -> CommandPhase {
        match self {
            Self::Acknowledged { .. } => CommandPhase::Acknowledged,
            Self::Rejected(_) => CommandPhase::Rejected,
        }
    }

    pub fn into_response(self, id: impl Into<String>) -> ResponsePayload {
        match self {
            Self::Acknowledged { values } => ResponsePayload::success(id, values),
            Self::Rejected(error) => ResponsePayload::failure(id, error),
        }
    }
}
