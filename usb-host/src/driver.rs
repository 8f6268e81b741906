//! Class/vendor driver interface, the priority-ordered registry and the
//! binding resolver.

use alloc::{sync::Arc, vec::Vec};

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use spin::RwLock;

use coral_usb_if::descriptor::{DeviceDescriptor, InterfaceDescriptor};
use coral_usb_if::err::{Result, UsbError};

use crate::bus::Bus;
use crate::device::{Device, Lifecycle};
use crate::stack::UsbHostStack;
use crate::DeviceId;

bitflags::bitflags! {
    /// Which descriptor fields a driver's filter constrains. Product
    /// requires vendor, release requires product; subclass requires class,
    /// protocol requires subclass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchFlags: u8 {
        const VENDOR_ID = 1 << 0;
        const PRODUCT_ID = 1 << 1;
        const RELEASE_NUMBER = 1 << 2;
        const CLASS = 1 << 3;
        const SUBCLASS = 1 << 4;
        const PROTOCOL = 1 << 5;
    }
}

/// Per-flag scores; more specific filters outrank generic ones.
const MATCH_SCORES: [u8; 6] = [10, 4, 3, 3, 2, 1];

/// Declarative match predicate over device or interface descriptors.
#[derive(Debug, Clone, Copy)]
pub struct MatchFilter {
    pub flags: MatchFlags,
    pub vendor_id: u16,
    pub product_id: u16,
    pub release_low: u16,
    pub release_high: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl Default for MatchFilter {
    fn default() -> Self {
        Self {
            flags: MatchFlags::empty(),
            vendor_id: 0,
            product_id: 0,
            release_low: 0,
            release_high: 0xffff,
            class: 0,
            subclass: 0,
            protocol: 0,
        }
    }
}

impl MatchFilter {
    /// Vendor-driver filter: vendor id, optionally narrowed to one product.
    pub fn for_vendor(vendor_id: u16, product_id: Option<u16>) -> Self {
        let mut filter = Self {
            flags: MatchFlags::VENDOR_ID,
            vendor_id,
            ..Default::default()
        };
        if let Some(product_id) = product_id {
            filter.flags |= MatchFlags::PRODUCT_ID;
            filter.product_id = product_id;
        }
        filter
    }

    /// Standard-driver filter over interface class/subclass/protocol.
    pub fn for_class(class: u8, subclass: Option<u8>, protocol: Option<u8>) -> Self {
        let mut filter = Self {
            flags: MatchFlags::CLASS,
            class,
            ..Default::default()
        };
        if let Some(subclass) = subclass {
            filter.flags |= MatchFlags::SUBCLASS;
            filter.subclass = subclass;
        }
        if let Some(protocol) = protocol {
            filter.flags |= MatchFlags::PROTOCOL;
            filter.protocol = protocol;
        }
        filter
    }

    fn is_well_formed(&self) -> bool {
        let f = self.flags;
        if f.is_empty() {
            return false;
        }
        if f.contains(MatchFlags::PRODUCT_ID) && !f.contains(MatchFlags::VENDOR_ID) {
            return false;
        }
        if f.contains(MatchFlags::RELEASE_NUMBER) && !f.contains(MatchFlags::PRODUCT_ID) {
            return false;
        }
        if f.contains(MatchFlags::SUBCLASS) && !f.contains(MatchFlags::CLASS) {
            return false;
        }
        if f.contains(MatchFlags::PROTOCOL) && !f.contains(MatchFlags::SUBCLASS) {
            return false;
        }
        true
    }

    /// Registry sort key: the sum of the per-flag scores, descending.
    pub(crate) fn score(&self) -> Result<u8> {
        if !self.is_well_formed() {
            return Err(UsbError::InvalidArgument);
        }
        let mut score = 0u8;
        for (bit, points) in MATCH_SCORES.iter().enumerate() {
            if self.flags.bits() & (1 << bit) != 0 {
                score += points;
            }
        }
        Ok(score)
    }

    pub fn matches_device(&self, descriptor: &DeviceDescriptor) -> bool {
        if !self.flags.contains(MatchFlags::VENDOR_ID) {
            return false;
        }
        if descriptor.vendor_id != self.vendor_id {
            return false;
        }
        if self.flags.contains(MatchFlags::PRODUCT_ID) && descriptor.product_id != self.product_id
        {
            return false;
        }
        if self.flags.contains(MatchFlags::RELEASE_NUMBER)
            && !(self.release_low..=self.release_high).contains(&descriptor.device_release)
        {
            return false;
        }
        true
    }

    pub fn matches_interface(&self, descriptor: &InterfaceDescriptor) -> bool {
        if !self.flags.contains(MatchFlags::CLASS) {
            return false;
        }
        if descriptor.class != self.class {
            return false;
        }
        if self.flags.contains(MatchFlags::SUBCLASS) && descriptor.subclass != self.subclass {
            return false;
        }
        if self.flags.contains(MatchFlags::PROTOCOL) && descriptor.protocol != self.protocol {
            return false;
        }
        true
    }
}

/// A pluggable class or vendor driver.
///
/// Vendor drivers get first refusal on the whole, still-unconfigured device
/// through `examine_device`/`initialize_device`; standard drivers are
/// matched per interface once a configuration is chosen. `disconnect` is
/// called exactly once during teardown for every binding level that claimed
/// the device.
pub trait ClassDriver: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn filter(&self) -> MatchFilter;

    fn examine_device(&self, descriptor: &DeviceDescriptor) -> bool {
        self.filter().matches_device(descriptor)
    }

    fn examine_interface(&self, descriptor: &InterfaceDescriptor) -> bool {
        self.filter().matches_interface(descriptor)
    }

    fn initialize_device<'a>(
        &'a self,
        _stack: &'a UsbHostStack,
        _device: DeviceId,
    ) -> BoxFuture<'a, Result<()>> {
        futures::future::ready(Err(UsbError::Unavailable)).boxed()
    }

    fn initialize_interface<'a>(
        &'a self,
        _stack: &'a UsbHostStack,
        _device: DeviceId,
        _interface_number: u8,
    ) -> BoxFuture<'a, Result<()>> {
        futures::future::ready(Err(UsbError::Unavailable)).boxed()
    }

    fn disconnect<'a>(
        &'a self,
        _stack: &'a UsbHostStack,
        _device: DeviceId,
    ) -> BoxFuture<'a, Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }
}

struct Registration {
    driver: Arc<dyn ClassDriver>,
    score: u8,
}

/// Process-wide driver list, descending score. Read-mostly: matching scans
/// take the read lock, registration the write lock.
pub(crate) struct DriverRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Inserts by descending score; equal scores keep registration order.
    /// Returns the cursor of the new entry.
    pub fn register(&self, driver: Arc<dyn ClassDriver>) -> Result<usize> {
        let score = driver.filter().score()?;
        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|entry| entry.score < score)
            .unwrap_or(entries.len());
        entries.insert(position, Registration { driver, score });
        Ok(position)
    }

    pub fn deregister(&self, driver: &Arc<dyn ClassDriver>) -> Result<()> {
        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.driver, driver))
            .ok_or(UsbError::InvalidArgument)?;
        entries.remove(position);
        Ok(())
    }

    /// Scans from `cursor` for a driver accepting the device descriptor.
    /// The scan ends where the priority order wraps back to its start;
    /// `only_this_driver` restricts it to the cursor entry alone.
    pub fn find_next_device_match(
        &self,
        descriptor: &DeviceDescriptor,
        cursor: usize,
        only_this_driver: bool,
    ) -> Option<(usize, Arc<dyn ClassDriver>)> {
        let entries = self.entries.read();
        for (index, entry) in entries.iter().enumerate().skip(cursor) {
            if entry.driver.examine_device(descriptor) {
                return Some((index, entry.driver.clone()));
            }
            if only_this_driver {
                break;
            }
        }
        None
    }

    /// Interface-descriptor variant of [`Self::find_next_device_match`].
    pub fn find_next_interface_match(
        &self,
        descriptor: &InterfaceDescriptor,
        cursor: usize,
        only_this_driver: bool,
    ) -> Option<(usize, Arc<dyn ClassDriver>)> {
        let entries = self.entries.read();
        for (index, entry) in entries.iter().enumerate().skip(cursor) {
            if entry.driver.examine_interface(descriptor) {
                return Some((index, entry.driver.clone()));
            }
            if only_this_driver {
                break;
            }
        }
        None
    }
}

impl UsbHostStack {
    /// Offers the whole, as-yet-unconfigured device to vendor drivers. The
    /// first driver whose `examine_device` accepts gets one initialization
    /// attempt; on success the device-level binding is recorded and
    /// standard drivers are skipped entirely.
    pub(crate) async fn bind_vendor_driver(
        &self,
        device: &Arc<Device>,
        cursor: usize,
        only_this_driver: bool,
    ) -> Option<Arc<dyn ClassDriver>> {
        let descriptor = device.state.lock().descriptor.clone();
        let (_, driver) =
            self.drivers()
                .find_next_device_match(&descriptor, cursor, only_this_driver)?;

        match driver.initialize_device(self, device.id).await {
            Ok(()) => {
                info!(
                    "device {}: vendor driver {} bound",
                    device.id,
                    driver.name()
                );
                device.state.lock().vendor_driver = Some(driver.clone());
                Some(driver)
            }
            Err(err) => {
                warn!(
                    "device {}: vendor driver {} failed to initialize: {err}",
                    device.id,
                    driver.name()
                );
                None
            }
        }
    }

    /// Standard-driver binding: walk configurations in declaration order,
    /// configure the first one under which at least one interface can be
    /// claimed, and initialize a driver per claimable interface. A
    /// configuration that ends up with zero claims is unconfigured again
    /// before the next is tried.
    pub(crate) async fn bind_standard_driver(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
    ) -> Result<()> {
        let num_configs = device.state.lock().configurations.len();

        for config_index in 0..num_configs {
            let mut configured = false;
            let mut initialized = 0usize;

            let num_interfaces = {
                let state = device.state.lock();
                state.configurations[config_index].descriptor.interfaces.len()
            };

            'interfaces: for intf_index in 0..num_interfaces {
                let mut cursor = 0usize;
                loop {
                    let (interface_number, alt_settings) = {
                        let state = device.state.lock();
                        let intf =
                            &state.configurations[config_index].descriptor.interfaces[intf_index];
                        (intf.interface_number, intf.alt_settings.clone())
                    };

                    let found = alt_settings.iter().find_map(|alt| {
                        self.drivers().find_next_interface_match(alt, cursor, false)
                    });
                    let Some((position, driver)) = found else {
                        break;
                    };

                    if !configured {
                        match self.set_config_inner(bus, device, config_index).await {
                            Ok(()) => configured = true,
                            Err(err) => {
                                debug!(
                                    "device {}: configuration index {config_index} rejected: {err}",
                                    device.id
                                );
                                break 'interfaces;
                            }
                        }
                    }

                    match self
                        .initialize_interface_with(device, &driver, config_index, intf_index, interface_number)
                        .await
                    {
                        Ok(()) => {
                            initialized += 1;
                            break;
                        }
                        Err(err) => {
                            debug!(
                                "device {}: driver {} declined interface {interface_number}: {err}",
                                device.id,
                                driver.name()
                            );
                            cursor = position + 1;
                            if cursor >= self.drivers().len() {
                                break;
                            }
                        }
                    }
                }
            }

            if configured {
                if initialized == 0 {
                    // Nobody claimed anything under this configuration.
                    if let Err(err) = self.unset_config_inner(bus, device).await {
                        warn!("device {}: unconfigure failed: {err}", device.id);
                    }
                    continue;
                }
                return Ok(());
            }
        }

        Err(UsbError::Unavailable)
    }

    async fn initialize_interface_with(
        &self,
        device: &Arc<Device>,
        driver: &Arc<dyn ClassDriver>,
        config_index: usize,
        intf_index: usize,
        interface_number: u8,
    ) -> Result<()> {
        driver
            .initialize_interface(self, device.id, interface_number)
            .await?;
        info!(
            "device {}: driver {} bound to interface {interface_number}",
            device.id,
            driver.name()
        );
        device.state.lock().configurations[config_index].interfaces[intf_index].driver =
            Some(driver.clone());
        Ok(())
    }

    /// Offers still-unclaimed interfaces of an already-configured device to
    /// the driver at `cursor` only.
    pub(crate) async fn init_interfaces_with(&self, device: &Arc<Device>, cursor: usize) {
        let Some(config_index) = device.state.lock().active_config else {
            return;
        };
        let num_interfaces = {
            let state = device.state.lock();
            state.configurations[config_index].descriptor.interfaces.len()
        };

        for intf_index in 0..num_interfaces {
            let (claimed, interface_number, alt_settings) = {
                let state = device.state.lock();
                let config = &state.configurations[config_index];
                (
                    config.interfaces[intf_index].driver.is_some(),
                    config.descriptor.interfaces[intf_index].interface_number,
                    config.descriptor.interfaces[intf_index].alt_settings.clone(),
                )
            };
            if claimed {
                continue;
            }

            let found = alt_settings
                .iter()
                .find_map(|alt| self.drivers().find_next_interface_match(alt, cursor, true));
            if let Some((_, driver)) = found {
                let _ = self
                    .initialize_interface_with(device, &driver, config_index, intf_index, interface_number)
                    .await;
            }
        }
    }

    /// Walks every bus for enumerated devices without a driver and offers
    /// them to the newly registered driver at `cursor`.
    pub(crate) async fn attempt_unclaimed_devices(&self, cursor: usize) {
        for bus in self.buses_snapshot() {
            let devices: Vec<Arc<Device>> =
                bus.registry.lock().devices.values().cloned().collect();

            for device in devices {
                if device.is_root_hub() {
                    continue;
                }
                let (configured, needs_driver) = {
                    let state = device.state.lock();
                    if state.lifecycle == Lifecycle::Detached {
                        continue;
                    }
                    if state.vendor_driver.is_some() {
                        continue;
                    }
                    match state.active_config {
                        None => (false, true),
                        Some(index) => (
                            true,
                            state.configurations[index]
                                .interfaces
                                .iter()
                                .any(|intf| intf.driver.is_none()),
                        ),
                    }
                };
                if !needs_driver {
                    continue;
                }

                if configured {
                    self.init_interfaces_with(&device, cursor).await;
                } else if self.bind_vendor_driver(&device, cursor, true).await.is_none() {
                    let _ = self.bind_standard_driver(&bus, &device).await;
                }
            }
        }
    }

    /// Whether any live device or interface is bound to `driver`. Gates
    /// deregistration: only inactive drivers may leave the registry.
    pub(crate) fn any_claimed_device(&self, driver: &Arc<dyn ClassDriver>) -> bool {
        for bus in self.buses_snapshot() {
            let registry = bus.registry.lock();
            for device in registry.devices.values() {
                let state = device.state.lock();
                if state
                    .vendor_driver
                    .as_ref()
                    .is_some_and(|bound| Arc::ptr_eq(bound, driver))
                {
                    return true;
                }
                if let Some(index) = state.active_config {
                    if state.configurations[index]
                        .interfaces
                        .iter()
                        .any(|intf| intf.driver.as_ref().is_some_and(|d| Arc::ptr_eq(d, driver)))
                    {
                        return true;
                    }
                }
            }
        }
        false
    }
}
