//! Registered-device slots and their endpoint side table.
//!
//! Slots are created and destroyed by the enumeration engine (`attach`/`detach`); command
//! handling only resolves handles and updates the endpoint side table. All of it lives behind the
//! single lock in [`SharedRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::host::HostDevice;

/// Guest-visible device handle: slot index in the low byte, attach generation in bits 16..32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl DeviceHandle {
    fn new(index: usize, generation: u16) -> Self {
        Self((u32::from(generation) << 16) | (index as u32 & 0xff))
    }

    pub fn index(self) -> usize {
        (self.0 & 0xff) as usize
    }

    pub fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredDevice {
    pub host_id: u64,
    pub interface_number: u8,
    generation: u16,
}

/// Interrupt endpoint addresses discovered by the last device-parameter query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdditionalDeviceData {
    pub interrupt_in_endpoint: Option<u8>,
    pub interrupt_out_endpoint: Option<u8>,
}

pub struct DeviceRegistry {
    slots: Vec<Option<RegisteredDevice>>,
    extra: Vec<AdditionalDeviceData>,
    hosts: HashMap<u64, Arc<dyn HostDevice>>,
    next_generation: u16,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("slots", &self.slots)
            .field("extra", &self.extra)
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            extra: vec![AdditionalDeviceData::default(); capacity],
            hosts: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn alloc_generation(&mut self) -> u16 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        generation
    }

    /// Bind a free slot to `interface_number` of `host`. Returns `None` when the registry is full.
    pub fn attach(
        &mut self,
        host: Arc<dyn HostDevice>,
        interface_number: u8,
    ) -> Option<DeviceHandle> {
        let index = self.slots.iter().position(Option::is_none)?;
        let generation = self.alloc_generation();
        let host_id = host.id();
        self.hosts.insert(host_id, host);
        self.slots[index] = Some(RegisteredDevice {
            host_id,
            interface_number,
            generation,
        });
        self.extra[index] = AdditionalDeviceData::default();
        tracing::debug!(index, host_id, interface_number, "registered USBv5 device");
        Some(DeviceHandle::new(index, generation))
    }

    /// Drop every slot bound to `host_id` and forget the host device.
    pub fn detach(&mut self, host_id: u64) -> Vec<DeviceHandle> {
        let mut removed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(device) = slot.filter(|device| device.host_id == host_id) {
                removed.push(DeviceHandle::new(index, device.generation));
                *slot = None;
                self.extra[index] = AdditionalDeviceData::default();
            }
        }
        self.hosts.remove(&host_id);
        removed
    }

    /// Resolve a guest handle to its slot index.
    pub fn resolve(&self, handle: u32) -> Option<usize> {
        let handle = DeviceHandle(handle);
        let index = handle.index();
        match self.slots.get(index)? {
            Some(device) if DeviceHandle::new(index, device.generation) == handle => Some(index),
            _ => None,
        }
    }

    pub fn device(&self, index: usize) -> Option<&RegisteredDevice> {
        self.slots.get(index)?.as_ref()
    }

    pub fn host(&self, host_id: u64) -> Option<Arc<dyn HostDevice>> {
        self.hosts.get(&host_id).cloned()
    }

    pub fn endpoints(&self, index: usize) -> Option<&AdditionalDeviceData> {
        self.extra.get(index)
    }

    pub fn endpoints_mut(&mut self, index: usize) -> Option<&mut AdditionalDeviceData> {
        self.extra.get_mut(index)
    }

    /// Handles of every occupied slot, in slot order.
    pub fn handles(&self) -> impl Iterator<Item = (DeviceHandle, &RegisteredDevice)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let device = slot.as_ref()?;
            Some((DeviceHandle::new(index, device.generation), device))
        })
    }
}

/// The registry plus its lock, shared between command handling and the enumeration engine.
#[derive(Debug)]
pub struct SharedRegistry {
    inner: Mutex<DeviceRegistry>,
}

impl SharedRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(DeviceRegistry::new(capacity)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceRegistry> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
