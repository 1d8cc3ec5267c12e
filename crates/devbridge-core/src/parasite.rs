// ── Parasitic extensions ──
//
// A local device may supplement a device owned by another bridge
// instance. Its values go to the owner's `ext/<path>` sub-topic, never
// the owner's state topic. The data a target needs is resolved from its
// own static configuration first, then from the owner's last published
// state. A target that cannot be resolved is marked failed on its own;
// every other target carries on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use devbridge_broker::payload::Values;
use devbridge_broker::{
    Broker, DeviceId, ExtensionPath, InstanceId, StatePayload, TopicScheme, publish_json,
};

use crate::provider::CapabilityProvider;

/// Declared binding of a local device onto a foreign device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParasiteTarget {
    /// Local device whose values are supplemented onto the owner.
    pub device: DeviceId,
    pub owning_instance: InstanceId,
    pub owning_device: DeviceId,
    pub mqtt_path: ExtensionPath,
    /// Fields that must be known before the target can run.
    pub extracted_fields: Vec<String>,
    /// Values supplied by configuration; these win over the owner's state.
    #[serde(default)]
    pub static_values: Values,
}

/// Resolution state of one target.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetStatus {
    /// Waiting for the owner's state.
    Pending,
    Active { resolved: Values },
    Failed { missing: Vec<String>, reason: String },
}

impl TargetStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// What gets published on the owner's extension topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionPayload {
    pub source_instance: InstanceId,
    pub source_device: DeviceId,
    pub last_update: DateTime<Utc>,
    pub values: Values,
}

struct Slot {
    target: ParasiteTarget,
    owner_topic: String,
    ext_topic: String,
    status: TargetStatus,
}

enum Resolution {
    Resolved(Values),
    Missing(Vec<String>),
}

fn resolve(target: &ParasiteTarget, owner: Option<&Values>) -> Resolution {
    let mut resolved = Values::new();
    let mut missing = Vec::new();
    for field in &target.extracted_fields {
        let value = target
            .static_values
            .get(field)
            .or_else(|| owner.and_then(|o| o.get(field)));
        match value {
            Some(v) => {
                resolved.insert(field.clone(), v.clone());
            }
            None => missing.push(field.clone()),
        }
    }
    if missing.is_empty() {
        Resolution::Resolved(resolved)
    } else {
        Resolution::Missing(missing)
    }
}

pub struct ParasiteExtension {
    instance: InstanceId,
    broker: Arc<dyn Broker>,
    provider: Arc<dyn CapabilityProvider>,
    slots: Mutex<HashMap<DeviceId, Slot>>,
}

impl ParasiteExtension {
    pub fn new(
        instance: InstanceId,
        targets: Vec<ParasiteTarget>,
        broker: Arc<dyn Broker>,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Self {
        let scheme: &TopicScheme = broker.scheme();
        let slots = targets
            .into_iter()
            .map(|target| {
                let slot = Slot {
                    owner_topic: scheme.state_topic(&target.owning_instance, &target.owning_device),
                    ext_topic: scheme.extension_topic(
                        &target.owning_instance,
                        &target.owning_device,
                        &target.mqtt_path,
                    ),
                    status: TargetStatus::Pending,
                    target,
                };
                (slot.target.device.clone(), slot)
            })
            .collect();
        Self {
            instance,
            broker,
            provider,
            slots: Mutex::new(slots),
        }
    }

    /// Distinct owner state topics to subscribe to.
    pub fn owner_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .slots
            .lock()
            .values()
            .map(|s| s.owner_topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Whether `device` is parasitic and not yet (or no longer) usable.
    pub fn is_blocked(&self, device: &DeviceId) -> bool {
        self.slots
            .lock()
            .get(device)
            .is_some_and(|s| !s.status.is_active())
    }

    pub fn status(&self, device: &DeviceId) -> Option<TargetStatus> {
        self.slots.lock().get(device).map(|s| s.status.clone())
    }

    /// Activate every target its static configuration fully resolves.
    pub async fn resolve_static(&self) {
        let ready: Vec<(DeviceId, Values)> = self
            .slots
            .lock()
            .values()
            .filter(|s| !s.status.is_active())
            .filter_map(|s| match resolve(&s.target, None) {
                Resolution::Resolved(values) => Some((s.target.device.clone(), values)),
                Resolution::Missing(_) => None,
            })
            .collect();
        for (device, values) in ready {
            self.bind(&device, values).await;
        }
    }

    /// Feed the owner's retained state. Non-active targets bound to this
    /// owner are (re)resolved; active ones refresh their resolved values.
    pub async fn on_owner_state(&self, topic: &str, payload: &[u8]) {
        let state: StatePayload = match serde_json::from_slice(payload) {
            Ok(state) => state,
            Err(e) => {
                debug!(topic, error = %e, "ignoring undecodable owner state");
                return;
            }
        };

        let mut to_bind = Vec::new();
        {
            let mut slots = self.slots.lock();
            for slot in slots.values_mut().filter(|s| s.owner_topic == topic) {
                let active = slot.status.is_active();
                match (active, resolve(&slot.target, Some(&state.values))) {
                    (true, Resolution::Resolved(values)) => {
                        slot.status = TargetStatus::Active { resolved: values };
                    }
                    // Keep running on the values that were resolved before.
                    (true, Resolution::Missing(missing)) => {
                        debug!(device = %slot.target.device, ?missing, "owner state lacks fields");
                    }
                    (false, Resolution::Resolved(values)) => {
                        to_bind.push((slot.target.device.clone(), values));
                    }
                    (false, Resolution::Missing(missing)) => {
                        warn!(
                            device = %slot.target.device,
                            owner = %slot.target.owning_device,
                            ?missing,
                            "parasite target unresolvable"
                        );
                        slot.status = TargetStatus::Failed {
                            missing,
                            reason: "required fields absent from configuration and owner state"
                                .into(),
                        };
                    }
                }
            }
        }

        for (device, values) in to_bind {
            self.bind(&device, values).await;
        }
    }

    /// Fail every target still waiting for its owner.
    pub fn expire_pending(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            if slot.status == TargetStatus::Pending {
                let missing = match resolve(&slot.target, None) {
                    Resolution::Missing(missing) => missing,
                    Resolution::Resolved(_) => Vec::new(),
                };
                warn!(device = %slot.target.device, "owner state never arrived");
                slot.status = TargetStatus::Failed {
                    missing,
                    reason: "owner state unavailable".into(),
                };
            }
        }
    }

    async fn bind(&self, device: &DeviceId, values: Values) {
        let status = match self.provider.bind_parasite(device, &values).await {
            Ok(()) => {
                info!(%device, "parasite target active");
                TargetStatus::Active { resolved: values }
            }
            Err(e) => {
                warn!(%device, error = %e, "parasite binding failed");
                TargetStatus::Failed {
                    missing: Vec::new(),
                    reason: e.message,
                }
            }
        };
        if let Some(slot) = self.slots.lock().get_mut(device) {
            slot.status = status;
        }
    }

    /// Mirror a local device's fresh values onto its owner's extension
    /// topic. No-op unless the device is an active parasite.
    pub async fn publish_supplement(&self, device: &DeviceId, values: &Values) {
        let topic = match self.slots.lock().get(device) {
            Some(slot) if slot.status.is_active() => slot.ext_topic.clone(),
            _ => return,
        };
        let payload = ExtensionPayload {
            source_instance: self.instance.clone(),
            source_device: device.clone(),
            last_update: Utc::now(),
            values: values.clone(),
        };
        if let Err(e) = publish_json(self.broker.as_ref(), &topic, &payload, true).await {
            debug!(%device, topic, error = %e, "extension publish failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(fields: &[&str], statics: serde_json::Value) -> ParasiteTarget {
        ParasiteTarget {
            device: DeviceId::new("cam").unwrap(),
            owning_instance: InstanceId::new("zigbee").unwrap(),
            owning_device: DeviceId::new("door").unwrap(),
            mqtt_path: ExtensionPath::new("camera").unwrap(),
            extracted_fields: fields.iter().map(|f| (*f).to_owned()).collect(),
            static_values: statics.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn static_values_win_over_owner_state() {
        let t = target(&["ip", "port"], json!({"port": 554}));
        let owner = json!({"ip": "10.0.0.9", "port": 80}).as_object().unwrap().clone();
        let Resolution::Resolved(values) = resolve(&t, Some(&owner)) else {
            panic!("expected resolution");
        };
        assert_eq!(values["port"], json!(554));
        assert_eq!(values["ip"], json!("10.0.0.9"));
    }

    #[test]
    fn reports_missing_fields() {
        let t = target(&["ip", "token"], json!({}));
        let owner = json!({"ip": "10.0.0.9"}).as_object().unwrap().clone();
        let Resolution::Missing(missing) = resolve(&t, Some(&owner)) else {
            panic!("expected missing fields");
        };
        assert_eq!(missing, ["token"]);
    }
}
