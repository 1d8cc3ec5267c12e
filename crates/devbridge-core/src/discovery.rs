//! Dashboard discovery: one retained config entry per (device, platform).
//!
//! Fields map to platforms through a fixed name table; fields the table
//! does not know are left out. Entries are published whenever a device is
//! enabled, reconfigured, or the session (re)starts, and retracted with
//! an empty retained payload when it is disabled. Topics published for a
//! device are remembered so that platforms dropped by a capability change
//! are retracted too.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::{debug, error, warn};

use devbridge_broker::{
    Availability, Broker, DeviceId, ErrorCode, InstanceId, QoS, TopicScheme,
};

use crate::error::CoreError;
use crate::model::{DeviceDescriptor, FieldSpec, FieldType};

/// Default discovery topic prefix.
pub const DEFAULT_PREFIX: &str = "homeassistant";

const LIGHT_FIELDS: &[&str] = &["brightness", "color_temp", "color", "hue", "saturation"];
const SENSOR_FIELDS: &[&str] = &[
    "temperature",
    "humidity",
    "pressure",
    "illuminance",
    "battery",
    "energy",
    "power_draw",
    "voltage",
    "current",
    "co2",
];
const BINARY_SENSOR_FIELDS: &[&str] = &["motion", "occupancy", "contact", "leak", "smoke", "tamper"];
const COVER_FIELDS: &[&str] = &["position", "tilt"];
const CLIMATE_FIELDS: &[&str] = &["target_temperature", "hvac_mode"];
const LOCK_FIELDS: &[&str] = &["locked"];
const CAMERA_FIELDS: &[&str] = &["stream_url", "snapshot_url"];

/// Dashboard platform category.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    Light,
    Switch,
    Sensor,
    BinarySensor,
    Cover,
    Climate,
    Lock,
    Camera,
}

/// Settings for the discovery publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: DEFAULT_PREFIX.to_owned(),
        }
    }
}

/// One generated discovery message.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryEntry {
    pub platform: Platform,
    pub topic: String,
    pub payload: Value,
}

// ── Field → platform table ───────────────────────────────────────────

/// Group the fields of a model by platform. Deterministic: platforms in
/// enum order, fields in declaration order.
pub fn group_fields<'a, I>(fields: I) -> BTreeMap<Platform, Vec<(&'a str, &'a FieldSpec)>>
where
    I: IntoIterator<Item = (&'a str, &'a FieldSpec)>,
{
    let fields: Vec<(&str, &FieldSpec)> = fields.into_iter().collect();
    let has_light_fields = fields.iter().any(|(name, _)| LIGHT_FIELDS.contains(name));

    let mut groups: BTreeMap<Platform, Vec<(&str, &FieldSpec)>> = BTreeMap::new();
    for (name, spec) in fields {
        let platform = match name {
            "power" if spec.writable && spec.field_type == FieldType::Bool => {
                if has_light_fields {
                    Platform::Light
                } else {
                    Platform::Switch
                }
            }
            n if LIGHT_FIELDS.contains(&n) => Platform::Light,
            n if SENSOR_FIELDS.contains(&n) => Platform::Sensor,
            n if BINARY_SENSOR_FIELDS.contains(&n) => Platform::BinarySensor,
            n if COVER_FIELDS.contains(&n) => Platform::Cover,
            n if CLIMATE_FIELDS.contains(&n) => Platform::Climate,
            n if LOCK_FIELDS.contains(&n) => Platform::Lock,
            n if CAMERA_FIELDS.contains(&n) => Platform::Camera,
            _ => continue,
        };
        groups.entry(platform).or_default().push((name, spec));
    }
    groups
}

/// Discovery node ids only allow `[A-Za-z0-9_-]`. ASCII alphanumerics
/// pass through, every other character becomes `-<hex>-`, and `_` only
/// ever joins the instance to the device, so distinct pairs never share
/// a node id.
fn node_id(instance: &InstanceId, device: &DeviceId) -> String {
    let mut node = String::with_capacity(instance.as_str().len() + device.as_str().len() + 1);
    escape_node_part(instance.as_str(), &mut node);
    node.push('_');
    escape_node_part(device.as_str(), &mut node);
    node
}

fn escape_node_part(raw: &str, out: &mut String) {
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            let _ = write!(out, "-{:x}-", u32::from(c));
        }
    }
}

// ── DiscoveryPublisher ───────────────────────────────────────────────

pub struct DiscoveryPublisher {
    config: DiscoveryConfig,
    instance: InstanceId,
    connector_type: String,
    broker: Arc<dyn Broker>,
    /// Topics last published per device.
    published: Mutex<HashMap<DeviceId, BTreeSet<String>>>,
}

impl DiscoveryPublisher {
    pub fn new(
        config: DiscoveryConfig,
        instance: InstanceId,
        connector_type: impl Into<String>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            config,
            instance,
            connector_type: connector_type.into(),
            broker,
            published: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn scheme(&self) -> &TopicScheme {
        self.broker.scheme()
    }

    fn node_id(&self, device: &DeviceId) -> String {
        node_id(&self.instance, device)
    }

    pub fn entry_topic(&self, platform: Platform, device: &DeviceId) -> String {
        format!(
            "{prefix}/{platform}/{node}/{platform}/config",
            prefix = self.config.prefix,
            node = self.node_id(device),
        )
    }

    /// Build the entries for a device. Pure; does not publish.
    pub fn generate(&self, device: &DeviceDescriptor) -> Result<Vec<DiscoveryEntry>, CoreError> {
        let generation_error = |reason: String| CoreError::DiscoveryGeneration {
            device: device.id.clone(),
            reason,
        };

        for (name, spec) in device.capabilities.iter() {
            if let Some(defect) = spec.defect() {
                return Err(generation_error(format!("field {name}: {defect}")));
            }
        }

        let scheme = self.scheme();
        let node = self.node_id(&device.id);
        let availability = scheme.availability_topic(&self.instance);

        group_fields(device.capabilities.iter())
            .into_iter()
            .map(|(platform, fields)| {
                let writable = fields.iter().any(|(_, spec)| spec.writable);
                let field_map: Map<String, Value> = fields
                    .iter()
                    .map(|(name, spec)| {
                        serde_json::to_value(spec).map(|v| ((*name).to_owned(), v))
                    })
                    .collect::<Result<_, _>>()
                    .map_err(|e| generation_error(e.to_string()))?;

                let mut payload = json!({
                    "name": device.name,
                    "unique_id": format!("{node}_{platform}"),
                    "platform": platform,
                    "state_topic": scheme.state_topic(&self.instance, &device.id),
                    "availability_topic": availability,
                    "payload_available": Availability::Online.to_string(),
                    "payload_not_available": Availability::Offline.to_string(),
                    "fields": field_map,
                    "device": {
                        "identifiers": [node],
                        "name": device.name,
                        "model": self.connector_type,
                        "via_device": self.instance.as_str(),
                    },
                });
                if writable {
                    payload["command_topic"] =
                        Value::String(scheme.command_topic(&self.instance, &device.id));
                }

                Ok(DiscoveryEntry {
                    platform,
                    topic: self.entry_topic(platform, &device.id),
                    payload,
                })
            })
            .collect()
    }

    /// Publish (or refresh) every entry for `device`, retracting entries
    /// whose platform no longer applies.
    pub async fn publish(&self, device: &DeviceDescriptor) {
        if !self.config.enabled {
            return;
        }
        let entries = match self.generate(device) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    device = %device.id,
                    code = %ErrorCode::DiscoveryGenerationError,
                    error = %e,
                    "discovery generation failed"
                );
                return;
            }
        };

        let current: BTreeSet<String> = entries.iter().map(|e| e.topic.clone()).collect();
        let stale: Vec<String> = {
            let mut published = self.published.lock();
            let previous = published.insert(device.id.clone(), current.clone());
            previous
                .map(|prev| prev.difference(&current).cloned().collect())
                .unwrap_or_default()
        };

        for entry in entries {
            match serde_json::to_vec(&entry.payload) {
                Ok(body) => self.send(&device.id, &entry.topic, body).await,
                Err(e) => error!(device = %device.id, error = %e, "discovery payload encoding failed"),
            }
        }
        for topic in stale {
            debug!(device = %device.id, topic, "retracting dropped platform");
            self.send(&device.id, &topic, Vec::new()).await;
        }
    }

    /// Publish an empty retained payload to every entry topic of `device`,
    /// both previously published and currently derivable.
    pub async fn retract(&self, device: &DeviceDescriptor) {
        if !self.config.enabled {
            return;
        }
        let mut topics = self.published.lock().remove(&device.id).unwrap_or_default();
        if let Ok(entries) = self.generate(device) {
            topics.extend(entries.into_iter().map(|e| e.topic));
        }
        for topic in topics {
            self.send(&device.id, &topic, Vec::new()).await;
        }
    }

    async fn send(&self, device: &DeviceId, topic: &str, body: Vec<u8>) {
        if let Err(e) = self.broker.publish(topic, body, true, QoS::AtLeastOnce).await {
            warn!(%device, topic, error = %e, "discovery publish failed");
        }
    }
}
