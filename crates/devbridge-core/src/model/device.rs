use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devbridge_broker::payload::Values;
use devbridge_broker::{DeviceId, ErrorObject, StatePayload};

use super::capability::CapabilityModel;

/// Static registration of one device. Devices are never removed at
/// runtime; disabling only stops polling and retracts discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: CapabilityModel,
}

fn default_enabled() -> bool {
    true
}

impl DeviceDescriptor {
    pub fn new(id: DeviceId, name: impl Into<String>, capabilities: CapabilityModel) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            capabilities,
        }
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Last known snapshot of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub online: bool,
    pub values: Values,
    pub error: Option<ErrorObject>,
    pub last_update: DateTime<Utc>,
}

impl DeviceState {
    pub fn to_payload(&self) -> StatePayload {
        StatePayload {
            online: self.online,
            last_update: self.last_update,
            values: self.values.clone(),
            error: self.error.clone(),
        }
    }
}
