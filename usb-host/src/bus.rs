//! Per-controller resource registry: the device list, the address bitmap
//! and the bandwidth budget every other component draws from.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use coral_usb_if::host::Controller;

use crate::device::Device;
use crate::osal::SpinWhile;
use crate::{BusId, DeviceId};

/// Address 0 addresses a device still in the default state.
pub const DEFAULT_ADDRESS: u8 = 0;
/// The root hub is pinned at address 1.
pub const ROOT_HUB_ADDRESS: u8 = 1;
pub const MAX_ADDRESSES: usize = 128;

/// Function addresses 0..128, one bit each. Address 0 and the root hub
/// address are reserved at creation; allocation rotates from the last
/// assigned address so freshly released addresses are not immediately
/// recycled onto a new device.
pub(crate) struct AddressBitmap {
    bits: [u8; MAX_ADDRESSES / 8],
    last: u8,
}

impl AddressBitmap {
    pub fn new() -> Self {
        let mut map = Self {
            bits: [0; MAX_ADDRESSES / 8],
            last: ROOT_HUB_ADDRESS,
        };
        map.mark(DEFAULT_ADDRESS);
        map.mark(ROOT_HUB_ADDRESS);
        map
    }

    fn mark(&mut self, address: u8) {
        self.bits[address as usize / 8] |= 1 << (address % 8);
    }

    pub fn is_allocated(&self, address: u8) -> bool {
        self.bits[address as usize / 8] & (1 << (address % 8)) != 0
    }

    pub fn allocate(&mut self) -> Option<u8> {
        for step in 1..MAX_ADDRESSES as u32 {
            let candidate = ((self.last as u32 + step) % MAX_ADDRESSES as u32) as u8;
            if candidate == DEFAULT_ADDRESS {
                continue;
            }
            if !self.is_allocated(candidate) {
                self.mark(candidate);
                self.last = candidate;
                return Some(candidate);
            }
        }
        None
    }

    pub fn release(&mut self, address: u8) {
        if address == DEFAULT_ADDRESS || address == ROOT_HUB_ADDRESS {
            return;
        }
        self.bits[address as usize / 8] &= !(1 << (address % 8));
    }
}

/// State behind the bus-wide lock. Held only for bookkeeping, never across
/// a control transfer.
pub(crate) struct BusRegistry {
    pub devices: BTreeMap<DeviceId, Arc<Device>>,
    pub root_hub: Option<DeviceId>,
    pub addresses: AddressBitmap,
    /// Remaining µs per frame/microframe.
    pub avail_bandwidth: u32,
}

pub(crate) struct Bus {
    pub id: BusId,
    pub controller: Mutex<Box<dyn Controller>>,
    pub registry: Mutex<BusRegistry>,
    /// Total µs per frame/microframe, fixed by controller speed.
    pub total_bandwidth: u32,
    /// Bus-wide control transfer serialization token.
    ctrl_token: AtomicBool,
}

impl Bus {
    pub fn new(id: BusId, controller: Box<dyn Controller>, total_bandwidth: u32) -> Self {
        Self {
            id,
            controller: Mutex::new(controller),
            registry: Mutex::new(BusRegistry {
                devices: BTreeMap::new(),
                root_hub: None,
                addresses: AddressBitmap::new(),
                avail_bandwidth: total_bandwidth,
            }),
            total_bandwidth,
            ctrl_token: AtomicBool::new(false),
        }
    }

    pub fn with_controller<R>(&self, f: impl FnOnce(&mut dyn Controller) -> R) -> R {
        let mut controller = self.controller.lock();
        f(controller.as_mut())
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.registry.lock().devices.get(&id).cloned()
    }

    /// Acquires the bus-wide control serialization token. At most one
    /// control transfer is outstanding per bus; the guard releases the
    /// token exactly once on every exit path.
    pub async fn ctrl_serial(&self) -> CtrlGuard<'_> {
        SpinWhile::new(|| {
            self.ctrl_token
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        })
        .await;
        CtrlGuard { bus: self }
    }
}

pub(crate) struct CtrlGuard<'a> {
    bus: &'a Bus,
}

impl Drop for CtrlGuard<'_> {
    fn drop(&mut self) {
        self.bus.ctrl_token.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_addresses() {
        let map = AddressBitmap::new();
        assert!(map.is_allocated(DEFAULT_ADDRESS));
        assert!(map.is_allocated(ROOT_HUB_ADDRESS));
    }

    #[test]
    fn test_addresses_are_unique_until_released() {
        let mut map = AddressBitmap::new();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..MAX_ADDRESSES - 2 {
            let addr = map.allocate().expect("bitmap exhausted early");
            assert_ne!(addr, DEFAULT_ADDRESS);
            assert_ne!(addr, ROOT_HUB_ADDRESS);
            assert!(seen.insert(addr), "address {addr} handed out twice");
        }
        assert_eq!(map.allocate(), None);

        map.release(42);
        assert_eq!(map.allocate(), Some(42));
        assert_eq!(map.allocate(), None);
    }

    #[test]
    fn test_release_of_reserved_addresses_is_ignored() {
        let mut map = AddressBitmap::new();
        map.release(DEFAULT_ADDRESS);
        map.release(ROOT_HUB_ADDRESS);
        assert!(map.is_allocated(DEFAULT_ADDRESS));
        assert!(map.is_allocated(ROOT_HUB_ADDRESS));
    }
}
