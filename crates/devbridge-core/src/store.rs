// ── Device store ──
//
// Concurrent map of device records with a change counter. Records are
// immutable `Arc`s; writers clone, modify, and swap. Only device actors
// write, so per-device updates never race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use devbridge_broker::DeviceId;

use crate::model::{DeviceDescriptor, DeviceState};

/// Everything the bridge knows about one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub descriptor: DeviceDescriptor,
    /// `None` until the first poll or applied command.
    pub state: Option<DeviceState>,
    /// `issued_at` of the newest successfully applied command.
    pub last_applied_at: Option<DateTime<Utc>>,
    /// Bumped by every applied command. A poll that started under an
    /// older value read the device before that command landed.
    pub applied_seq: u64,
    pub consecutive_failures: u32,
}

impl DeviceRecord {
    fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            state: None,
            last_applied_at: None,
            applied_seq: 0,
            consecutive_failures: 0,
        }
    }
}

pub struct DeviceStore {
    records: DashMap<DeviceId, Arc<DeviceRecord>>,
    /// Registration order, for stable iteration.
    order: Vec<DeviceId>,
    version: watch::Sender<u64>,
}

impl DeviceStore {
    pub fn new(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let records = DashMap::new();
        let mut order = Vec::new();
        for descriptor in devices {
            order.push(descriptor.id.clone());
            records.insert(descriptor.id.clone(), Arc::new(DeviceRecord::new(descriptor)));
        }
        let (version, _) = watch::channel(0);
        Self {
            records,
            order,
            version,
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<DeviceRecord>> {
        self.records.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.records.contains_key(id)
    }

    /// Clone-modify-swap one record. Returns the new record, or `None`
    /// if the device is unknown.
    pub fn update<F>(&self, id: &DeviceId, f: F) -> Option<Arc<DeviceRecord>>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let updated = {
            let mut entry = self.records.get_mut(id)?;
            let mut record = DeviceRecord::clone(entry.value());
            f(&mut record);
            let record = Arc::new(record);
            *entry.value_mut() = Arc::clone(&record);
            record
        };
        self.version.send_modify(|v| *v += 1);
        Some(updated)
    }

    /// Device ids in registration order.
    pub fn ids(&self) -> &[DeviceId] {
        &self.order
    }

    pub fn snapshot(&self) -> Vec<Arc<DeviceRecord>> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Bumped on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::CapabilityModel;

    fn device(id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceId::new(id).unwrap(), id, CapabilityModel::new())
    }

    #[test]
    fn keeps_registration_order() {
        let store = DeviceStore::new([device("b"), device("a"), device("c")]);
        let ids: Vec<&str> = store.ids().iter().map(DeviceId::as_str).collect();
        assert_eq!(ids, ["b", "a", "c"]);
    }

    #[test]
    fn update_swaps_record_and_bumps_version() {
        let store = DeviceStore::new([device("a")]);
        let id = DeviceId::new("a").unwrap();
        let rx = store.subscribe();
        let before = store.get(&id).unwrap();

        let after = store
            .update(&id, |r| r.consecutive_failures = 2)
            .unwrap();

        assert_eq!(before.consecutive_failures, 0);
        assert_eq!(after.consecutive_failures, 2);
        assert_eq!(*rx.borrow(), 1);
        assert!(store.update(&DeviceId::new("zz").unwrap(), |_| {}).is_none());
    }
}
