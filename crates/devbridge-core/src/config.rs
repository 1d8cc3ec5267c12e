// ── Runtime configuration ──
//
// Fully-resolved settings for one bridge instance. Built by the
// embedder (usually from `devbridge-config`); the bridge validates it
// once at construction and treats it as immutable afterwards.

use std::collections::HashSet;
use std::time::Duration;

use devbridge_broker::{DeviceId, InstanceId, TopicScheme};

use crate::discovery::DiscoveryConfig;
use crate::error::CoreError;
use crate::model::DeviceDescriptor;
use crate::parasite::ParasiteTarget;

/// Configuration for a [`DeviceBridge`](crate::DeviceBridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub instance: InstanceId,
    /// Connector family name; reported as the discovery `model`.
    pub connector_type: String,
    pub poll_interval: Duration,
    pub command_workers: usize,
    /// Per-worker queue depth before commands are answered `overloaded`.
    pub command_queue: usize,
    /// Consecutive poll failures that trigger a warning.
    pub failure_warn_threshold: u32,
    /// How long parasite targets may wait for their owner's state.
    pub parasite_resolve_timeout: Duration,
    pub discovery: DiscoveryConfig,
    pub devices: Vec<DeviceDescriptor>,
    pub parasites: Vec<ParasiteTarget>,
}

impl BridgeConfig {
    pub fn new(instance: InstanceId, connector_type: impl Into<String>) -> Self {
        Self {
            instance,
            connector_type: connector_type.into(),
            poll_interval: Duration::from_secs(30),
            command_workers: 4,
            command_queue: 64,
            failure_warn_threshold: 3,
            parasite_resolve_timeout: Duration::from_secs(10),
            discovery: DiscoveryConfig::default(),
            devices: Vec::new(),
            parasites: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceDescriptor) -> Self {
        self.devices.push(device);
        self
    }

    #[must_use]
    pub fn with_parasite(mut self, target: ParasiteTarget) -> Self {
        self.parasites.push(target);
        self
    }

    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.connector_type.trim().is_empty() {
            return Err(CoreError::config("connector_type must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(CoreError::config("poll interval must be greater than zero"));
        }
        if self.command_workers == 0 {
            return Err(CoreError::config("at least one command worker is required"));
        }
        if self.command_queue == 0 {
            return Err(CoreError::config("command queue depth must be greater than zero"));
        }
        if self.discovery.enabled {
            TopicScheme::new(&self.discovery.prefix).map_err(|e| {
                CoreError::config(format!("invalid discovery prefix: {e}"))
            })?;
            if self.discovery.prefix.is_empty() {
                return Err(CoreError::config("discovery prefix must not be empty"));
            }
        }

        let mut seen: HashSet<&DeviceId> = HashSet::new();
        for device in &self.devices {
            if !seen.insert(&device.id) {
                return Err(CoreError::DuplicateDevice {
                    device: device.id.clone(),
                });
            }
        }

        let mut bound: HashSet<&DeviceId> = HashSet::new();
        for target in &self.parasites {
            let invalid = |reason: &str| CoreError::InvalidParasite {
                device: target.device.clone(),
                reason: reason.to_owned(),
            };
            if !seen.contains(&target.device) {
                return Err(invalid("bound to an undeclared device"));
            }
            if !bound.insert(&target.device) {
                return Err(invalid("device carries more than one parasite target"));
            }
            if target.owning_instance == self.instance {
                return Err(invalid("owner must belong to a different instance"));
            }
            if target.extracted_fields.is_empty() {
                return Err(invalid("extracted_fields must not be empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::CapabilityModel;
    use devbridge_broker::ExtensionPath;
    use devbridge_broker::payload::Values;

    fn device(id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceId::new(id).unwrap(), id, CapabilityModel::new())
    }

    fn config() -> BridgeConfig {
        BridgeConfig::new(InstanceId::new("local").unwrap(), "sim").with_device(device("a"))
    }

    fn parasite(device: &str, owner_instance: &str) -> ParasiteTarget {
        ParasiteTarget {
            device: DeviceId::new(device).unwrap(),
            owning_instance: InstanceId::new(owner_instance).unwrap(),
            owning_device: DeviceId::new("door").unwrap(),
            mqtt_path: ExtensionPath::new("cam").unwrap(),
            extracted_fields: vec!["ip".into()],
            static_values: Values::new(),
        }
    }

    #[test]
    fn accepts_minimal_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_devices() {
        let err = config().with_device(device("a")).validate().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateDevice { .. }));
    }

    #[test]
    fn rejects_bad_parasites() {
        for target in [parasite("ghost", "other"), parasite("a", "local")] {
            let err = config().with_parasite(target).validate().unwrap_err();
            assert!(matches!(err, CoreError::InvalidParasite { .. }), "{err}");
        }
        assert!(config().with_parasite(parasite("a", "other")).validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers_and_bad_prefix() {
        let mut cfg = config();
        cfg.command_workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.discovery.prefix = "home/#".into();
        assert!(cfg.validate().is_err());
    }
}
