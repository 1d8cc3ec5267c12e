//! Built-in connector that simulates devices in memory.
//!
//! Each device starts from its configured `initial` values (plus a
//! neutral default for every other readable field), echoes applied
//! commands back into its state, and can be told to fail every Nth poll.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use devbridge_broker::DeviceId;
use devbridge_broker::payload::Values;
use devbridge_core::{CapabilityProvider, DeviceDescriptor, FieldKind, ProviderError};

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationOptions {
    /// Fail every Nth poll of each device. Zero never fails.
    pub fail_every: u32,
    pub latency: Duration,
}

struct SimDevice {
    values: Values,
    polls: u32,
}

pub struct SimulatedProvider {
    options: SimulationOptions,
    devices: Mutex<HashMap<DeviceId, SimDevice>>,
}

impl SimulatedProvider {
    pub fn new(options: SimulationOptions) -> Self {
        Self {
            options,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Register a device. Initial values override the neutral defaults.
    pub fn add_device(&self, device: &DeviceDescriptor, initial: &Values) {
        let mut values: Values = device
            .capabilities
            .iter()
            .filter(|(_, spec)| spec.readable)
            .filter_map(|(name, spec)| neutral_value(&spec.kind()).map(|v| (name.to_owned(), v)))
            .collect();
        values.extend(initial.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.devices
            .lock()
            .insert(device.id.clone(), SimDevice { values, polls: 0 });
    }

    async fn delay(&self) {
        if !self.options.latency.is_zero() {
            tokio::time::sleep(self.options.latency).await;
        }
    }
}

/// A value every field of this kind accepts, if there is an obvious one.
fn neutral_value(kind: &FieldKind) -> Option<Value> {
    let candidate = match kind {
        FieldKind::Bool => Value::Bool(false),
        FieldKind::Int { .. } => Value::from(0),
        FieldKind::Float { .. } => Value::from(0.0),
        FieldKind::Enum { options } => Value::String(options.first()?.clone()),
        FieldKind::Text => Value::String(String::new()),
    };
    kind.check(&candidate).is_ok().then_some(candidate)
}

#[async_trait]
impl CapabilityProvider for SimulatedProvider {
    async fn get_state(&self, device: &DeviceDescriptor) -> Result<Values, ProviderError> {
        self.delay().await;
        let mut devices = self.devices.lock();
        let sim = devices
            .get_mut(&device.id)
            .ok_or_else(|| ProviderError::permanent("device is not simulated"))?;
        sim.polls = sim.polls.wrapping_add(1);
        if self.options.fail_every > 0 && sim.polls % self.options.fail_every == 0 {
            debug!(device = %device.id, poll = sim.polls, "injecting poll failure");
            return Err(ProviderError::transient("simulated poll failure"));
        }
        Ok(sim.values.clone())
    }

    async fn apply_command(
        &self,
        device: &DeviceDescriptor,
        values: &Values,
    ) -> Result<Values, ProviderError> {
        self.delay().await;
        let mut devices = self.devices.lock();
        let sim = devices
            .get_mut(&device.id)
            .ok_or_else(|| ProviderError::permanent("device is not simulated"))?;
        sim.values
            .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        debug!(device = %device.id, fields = values.len(), "applied simulated command");
        Ok(values.clone())
    }

    async fn bind_parasite(&self, device: &DeviceId, resolved: &Values) -> Result<(), ProviderError> {
        info!(%device, fields = resolved.len(), "simulated parasite bound");
        if let Some(sim) = self.devices.lock().get_mut(device) {
            sim.values
                .extend(resolved.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }
}
