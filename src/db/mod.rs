use std::collections::BTreeMap;
use log::{debug, info};

use crate::models::{Device, DeviceHandle, DeviceUpdate, MeterConfig};


/// Home automation side of the bridge: where meters live and get their values
pub trait DeviceRegistry {
    fn lookup(&self, predicate: &dyn Fn(&Device) -> bool) -> Vec<DeviceHandle>;
    fn get(&self, handle: DeviceHandle) -> Option<&Device>;
    /// Returns true if the device changed
    fn update(&mut self, handle: DeviceHandle, update: DeviceUpdate) -> bool;
    fn create(&mut self, name: &str, config: MeterConfig) -> DeviceHandle;
    fn remove(&mut self, handle: DeviceHandle) -> Option<Device>;
}

/// In-memory registry, keeps track of created and changed devices so the
/// transport side can publish them
pub struct MemoryRegistry {
    devices: BTreeMap<DeviceHandle, Device>,
    created: Vec<DeviceHandle>,
    changed: Vec<DeviceHandle>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        return MemoryRegistry {
            devices: BTreeMap::new(),
            created: Vec::new(),
            changed: Vec::new(),
        };
    }

    /* First unused handle, starting at 1 */
    fn next_handle(&self) -> DeviceHandle {
        let mut h = 1;
        while self.devices.contains_key(&DeviceHandle(h)) {
            h += 1;
        }
        return DeviceHandle(h);
    }

    pub fn len(&self) -> usize {
        return self.devices.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.devices.is_empty();
    }

    pub fn take_created(&mut self) -> Vec<DeviceHandle> {
        return std::mem::take(&mut self.created);
    }

    pub fn take_changed(&mut self) -> Vec<DeviceHandle> {
        return std::mem::take(&mut self.changed);
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        return MemoryRegistry::new();
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn lookup(&self, predicate: &dyn Fn(&Device) -> bool) -> Vec<DeviceHandle> {
        let found: Vec<DeviceHandle> = self.devices.values().filter(|d| predicate(d)).map(|d| d.handle).collect();
        debug!("lookup found {} devices", found.len());
        return found;
    }

    fn get(&self, handle: DeviceHandle) -> Option<&Device> {
        return self.devices.get(&handle);
    }

    fn update(&mut self, handle: DeviceHandle, update: DeviceUpdate) -> bool {
        let device = match self.devices.get_mut(&handle) {
            Some(d) => d,
            None => return false,
        };

        if !device.apply(&update) {
            return false;
        }

        if !self.changed.contains(&handle) {
            self.changed.push(handle);
        }
        return true;
    }

    fn create(&mut self, name: &str, config: MeterConfig) -> DeviceHandle {
        let handle = self.next_handle();
        info!("Creating device {name} with handle {handle}");
        self.devices.insert(handle, Device::new(handle, name.to_string(), config));
        self.created.push(handle);
        return handle;
    }

    fn remove(&mut self, handle: DeviceHandle) -> Option<Device> {
        self.created.retain(|h| *h != handle);
        self.changed.retain(|h| *h != handle);
        let removed = self.devices.remove(&handle);
        if removed.is_some() {
            info!("Removed device {handle}");
        }
        return removed;
    }
}
