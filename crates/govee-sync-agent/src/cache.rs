//! Device registry and last-known state.

use govee_sync_core::{DeviceDescriptor, DeviceId, DeviceState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Devices from the latest successful inventory refresh.
#[derive(Debug, Default)]
pub struct Inventory {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceDescriptor>>>,
}

impl Inventory {
    /// Create an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for `id`, if listed.
    pub async fn get(&self, id: &str) -> Option<Arc<DeviceDescriptor>> {
        self.devices.read().await.get(id).cloned()
    }

    /// Whether `id` is listed.
    pub async fn contains(&self, id: &str) -> bool {
        self.devices.read().await.contains_key(id)
    }

    /// Listed device identifiers.
    pub async fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of listed devices.
    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Whether nothing is listed.
    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Replace every descriptor with a fresh listing.
    pub async fn replace_all(&self, devices: Vec<DeviceDescriptor>) -> Vec<Arc<DeviceDescriptor>> {
        let fresh: HashMap<DeviceId, Arc<DeviceDescriptor>> = devices
            .into_iter()
            .map(|d| (d.id.clone(), Arc::new(d)))
            .collect();
        let listed = fresh.values().cloned().collect();
        *self.devices.write().await = fresh;
        listed
    }
}

/// Process-wide map from device to last-known state.
///
/// Each device's state sits behind its own lock so writes for one device
/// never wait on another. The lock is only held for local mutation.
#[derive(Debug, Default)]
pub struct DeviceStateCache {
    states: RwLock<HashMap<DeviceId, Arc<Mutex<DeviceState>>>>,
}

impl DeviceStateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State slot for a device, created or reconciled against its
    /// advertised capabilities.
    pub async fn track(&self, descriptor: &DeviceDescriptor) -> Arc<Mutex<DeviceState>> {
        let existing = self.states.read().await.get(&descriptor.id).cloned();
        if let Some(slot) = existing {
            slot.lock().await.reconcile(descriptor);
            return slot;
        }

        self.states
            .write()
            .await
            .entry(descriptor.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceState::for_descriptor(descriptor))))
            .clone()
    }

    /// State slot for `id`, if tracked.
    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<DeviceState>>> {
        self.states.read().await.get(id).cloned()
    }

    /// Copy of the current state of `id`.
    pub async fn snapshot(&self, id: &str) -> Option<DeviceState> {
        let slot = self.get(id).await?;
        let state = slot.lock().await.clone();
        Some(state)
    }

    /// Copies of every tracked state.
    pub async fn snapshots(&self) -> Vec<DeviceState> {
        let slots: Vec<_> = self.states.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(slots.len());
        for slot in slots {
            states.push(slot.lock().await.clone());
        }
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    /// Stop tracking `id`.
    pub async fn remove(&self, id: &str) -> Option<DeviceState> {
        let slot = self.states.write().await.remove(id)?;
        let state = slot.lock().await.clone();
        Some(state)
    }

    /// Number of tracked devices.
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    /// Whether no device is tracked.
    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use govee_sync_core::{Attribute, AttributeValue, Capability};
    use std::collections::BTreeMap;

    fn lamp(caps: Vec<Capability>) -> DeviceDescriptor {
        DeviceDescriptor::new("AA:01", "H6008", "Lamp", caps)
    }

    #[tokio::test]
    async fn inventory_replacement() {
        let inventory = Inventory::new();
        inventory
            .replace_all(vec![lamp(vec![]), DeviceDescriptor::new("BB", "H5075", "Sensor", vec![])])
            .await;
        assert_eq!(inventory.ids().await, vec!["AA01", "BB"]);

        inventory.replace_all(vec![lamp(vec![])]).await;
        assert!(!inventory.contains("BB").await);
        assert_eq!(inventory.get("AA01").await.unwrap().sku, "H6008");
    }

    #[tokio::test]
    async fn tracking_keeps_state_and_adds_capabilities() {
        let cache = DeviceStateCache::new();
        let slot = cache
            .track(&lamp(vec![Capability::new(Attribute::Power)]))
            .await;
        slot.lock().await.apply_report(
            &BTreeMap::from([(Attribute::Power, AttributeValue::Switch(true))]),
            Utc::now(),
        );

        cache
            .track(&lamp(vec![
                Capability::new(Attribute::Power),
                Capability::new(Attribute::Brightness),
            ]))
            .await;

        let state = cache.snapshot("AA01").await.unwrap();
        assert_eq!(
            state.value(Attribute::Power),
            Some(&AttributeValue::Switch(true))
        );
        assert!(state.attributes.contains_key(&Attribute::Brightness));

        assert!(cache.remove("AA01").await.is_some());
        assert!(cache.is_empty().await);
    }
}
