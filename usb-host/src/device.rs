//! The per-device record: identity, descriptor cache and configuration
//! state, everything behind the device's own lock.

use alloc::{string::String, sync::Arc, vec::Vec};

use spin::Mutex;

use coral_usb_if::descriptor::{
    BosDescriptor, ConfigurationDescriptor, DeviceDescriptor, LanguageId,
};
use coral_usb_if::host::DeviceSpeed;

use crate::driver::ClassDriver;
use crate::{BusId, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// Attached, not yet addressed.
    Default,
    Addressed,
    Configured,
    /// Torn down; the record only persists until the last reference drops.
    Detached,
}

/// One physical or logical USB device.
///
/// Identity fields are immutable for the record's lifetime; everything the
/// protocol mutates lives in [`DeviceState`] behind the device lock. The
/// parent is a registry handle, never an owning pointer.
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) bus: BusId,
    pub(crate) speed: DeviceSpeed,
    pub(crate) parent: Option<DeviceId>,
    pub(crate) port_number: u8,
    pub(crate) state: Mutex<DeviceState>,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        bus: BusId,
        speed: DeviceSpeed,
        parent: Option<DeviceId>,
        port_number: u8,
        address: u8,
    ) -> Self {
        Self {
            id,
            bus,
            speed,
            parent,
            port_number,
            state: Mutex::new(DeviceState {
                address,
                lifecycle: Lifecycle::Default,
                descriptor: DeviceDescriptor::default(),
                configurations: Vec::new(),
                raw_configurations: Vec::new(),
                language_ids: Vec::new(),
                strings: Vec::new(),
                bos: None,
                raw_bos: None,
                active_config: None,
                vendor_driver: None,
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn port_number(&self) -> u8 {
        self.port_number
    }

    pub fn is_root_hub(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn address(&self) -> u8 {
        self.state.lock().address
    }
}

/// A string descriptor successfully fetched from the device, keyed by
/// string index and language.
pub(crate) struct CachedString {
    pub index: u8,
    pub language: LanguageId,
    pub text: String,
}

/// Host-side view of one declared configuration: the parsed descriptor tree
/// plus the bookkeeping the engine layers on top.
pub(crate) struct Configuration {
    pub descriptor: ConfigurationDescriptor,
    /// Bus time debited while this configuration is active; zero otherwise.
    pub load: u32,
    pub is_active: bool,
    /// Parallel to `descriptor.interfaces`.
    pub interfaces: Vec<InterfaceState>,
}

impl Configuration {
    pub fn new(descriptor: ConfigurationDescriptor) -> Self {
        let interfaces = descriptor
            .interfaces
            .iter()
            .map(|_| InterfaceState::default())
            .collect();
        Self {
            descriptor,
            load: 0,
            is_active: false,
            interfaces,
        }
    }
}

#[derive(Default)]
pub(crate) struct InterfaceState {
    /// Alternate setting currently realized in hardware; `None` while the
    /// configuration is inactive.
    pub current: Option<u8>,
    /// Standard class driver bound to this interface, if any.
    pub driver: Option<Arc<dyn ClassDriver>>,
}

pub(crate) struct DeviceState {
    pub address: u8,
    pub lifecycle: Lifecycle,
    pub descriptor: DeviceDescriptor,
    pub configurations: Vec<Configuration>,
    pub raw_configurations: Vec<Vec<u8>>,
    /// Languages advertised by string descriptor index 0.
    pub language_ids: Vec<LanguageId>,
    pub strings: Vec<CachedString>,
    pub bos: Option<BosDescriptor>,
    pub raw_bos: Option<Vec<u8>>,
    /// Index into `configurations`; `None` is the unconfigured sentinel.
    pub active_config: Option<usize>,
    /// Whole-device vendor driver binding; standard bindings are
    /// per-interface in [`InterfaceState`].
    pub vendor_driver: Option<Arc<dyn ClassDriver>>,
}

impl DeviceState {
    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.active_config
            .map(|index| &self.configurations[index])
            .filter(|config| config.is_active)
    }

    pub fn config_index_by_value(&self, value: u8) -> Option<usize> {
        self.configurations
            .iter()
            .position(|config| config.descriptor.configuration_value == value)
    }

    pub fn string(&self, index: u8, language: LanguageId) -> Option<&str> {
        self.strings
            .iter()
            .find(|entry| entry.index == index && entry.language == language)
            .map(|entry| entry.text.as_str())
    }

    pub fn has_string(&self, index: u8) -> bool {
        self.strings.iter().any(|entry| entry.index == index)
    }

    /// Drops every cached descriptor buffer. Invoked during teardown before
    /// the record itself is released.
    pub fn release_descriptor_caches(&mut self) {
        self.configurations.clear();
        self.raw_configurations.clear();
        self.strings.clear();
        self.language_ids.clear();
        self.bos = None;
        self.raw_bos = None;
    }
}
