use alloc::sync::Arc;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::device::Device;
use crate::error::BamError;
use crate::handle::{DeviceHandle, MAX_SLOTS};

struct Slot<M: RawMutex> {
    generation: u16,
    device: Option<Arc<Device<M>>>,
}

/// Arena of registered devices, guarded by the driver's global lock.
pub(crate) struct Registry<M: RawMutex> {
    slots: Vec<Slot<M>>,
}

impl<M: RawMutex> Registry<M> {
    pub(crate) const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.device.is_some()).count()
    }

    pub(crate) fn resolve(
        &self,
        handle: DeviceHandle,
    ) -> Option<Arc<Device<M>>> {
        let slot = self.slots.get(handle.slot()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.device.clone()
    }

    pub(crate) fn find_phys(&self, phys_addr: u64) -> Option<Arc<Device<M>>> {
        self.devices().find(|d| d.phys_addr() == phys_addr).cloned()
    }

    pub(crate) fn devices(&self) -> impl Iterator<Item = &Arc<Device<M>>> {
        self.slots.iter().filter_map(|s| s.device.as_ref())
    }

    /// Handle the next inserted device will get.
    ///
    /// Reusing a slot moves its generation on so that handles of the
    /// previous occupant no longer resolve.
    pub(crate) fn vacant(&self) -> Result<DeviceHandle, BamError> {
        let next = |g: u16| match g.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        if let Some((i, slot)) =
            self.slots.iter().enumerate().find(|(_, s)| s.device.is_none())
        {
            return Ok(DeviceHandle::new(i, next(slot.generation)));
        }
        if self.slots.len() >= MAX_SLOTS {
            return Err(BamError::ResourceExhausted);
        }
        Ok(DeviceHandle::new(self.slots.len(), next(0)))
    }

    /// Store a device under the handle obtained from [`Registry::vacant`].
    pub(crate) fn insert(&mut self, device: Arc<Device<M>>) {
        let handle = device.handle();
        let Some(index) = handle.slot() else {
            return;
        };
        if index == self.slots.len() {
            self.slots.push(Slot { generation: 0, device: None });
        }
        if let Some(slot) = self.slots.get_mut(index) {
            slot.generation = handle.generation();
            slot.device = Some(device);
        }
    }

    pub(crate) fn remove(
        &mut self,
        handle: DeviceHandle,
    ) -> Option<Arc<Device<M>>> {
        let slot = self.slots.get_mut(handle.slot()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.device.take()
    }
}
