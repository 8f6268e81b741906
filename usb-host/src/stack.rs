//! The host stack facade: controller and driver registration, the public
//! configuration/status API and the status-report sink.

use alloc::{boxed::Box, collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};

use spin::{Mutex, RwLock};

use coral_usb_if::descriptor::{ConfigurationDescriptor, DeviceDescriptor};
use coral_usb_if::err::{Result, UsbError};
use coral_usb_if::host::{Controller, DeviceSpeed};
use coral_usb_if::transfer::{Direction, Recipient, Request, RequestType, SetupPacket, feature};

use crate::bandwidth::{USB1_BANDWIDTH, USB2_BANDWIDTH};
use crate::bus::Bus;
use crate::control::{control_in, control_no_data};
use crate::device::{Device, Lifecycle};
use crate::driver::{ClassDriver, DriverRegistry};
use crate::osal::Kernel;
use crate::{BusId, DeviceId};

/// Out-of-band reports the stack emits on failure paths. Absence of a sink
/// is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    /// Enumeration finished but no driver claimed the device.
    UnsupportedDevice {
        bus: BusId,
        vendor_id: u16,
        product_id: u16,
    },
    EnumerationFailed {
        bus: BusId,
        port: u8,
        error: UsbError,
    },
}

pub trait StatusSink: Send + Sync + 'static {
    fn report(&self, report: &StatusReport);
}

/// The enumeration, configuration and resource-management engine of the
/// host stack. One instance manages any number of controllers; all state
/// lives in explicit registries with documented lock ownership.
///
/// The registry must exist before any enumeration can run; constructing
/// the stack first and adding controllers second enforces that order.
pub struct UsbHostStack {
    kernel: Arc<dyn Kernel>,
    buses: Mutex<BTreeMap<BusId, Arc<Bus>>>,
    drivers: DriverRegistry,
    status_sink: RwLock<Option<Arc<dyn StatusSink>>>,
    next_bus_id: AtomicU64,
    next_device_id: AtomicU64,
}

impl UsbHostStack {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            kernel,
            buses: Mutex::new(BTreeMap::new()),
            drivers: DriverRegistry::new(),
            status_sink: RwLock::new(None),
            next_bus_id: AtomicU64::new(0),
            next_device_id: AtomicU64::new(1),
        }
    }

    pub fn set_status_sink(&self, sink: Arc<dyn StatusSink>) {
        *self.status_sink.write() = Some(sink);
    }

    pub(crate) fn report(&self, report: &StatusReport) {
        if let Some(sink) = self.status_sink.read().as_ref() {
            sink.report(report);
        }
    }

    pub(crate) fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub(crate) fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub(crate) fn next_device_id(&self) -> DeviceId {
        DeviceId::from(self.next_device_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn buses_snapshot(&self) -> Vec<Arc<Bus>> {
        self.buses.lock().values().cloned().collect()
    }

    pub(crate) fn find_bus(&self, bus_id: BusId) -> Result<Arc<Bus>> {
        self.buses
            .lock()
            .get(&bus_id)
            .cloned()
            .ok_or(UsbError::InvalidArgument)
    }

    pub(crate) fn find_device(&self, device_id: DeviceId) -> Option<(Arc<Bus>, Arc<Device>)> {
        for bus in self.buses_snapshot() {
            if let Some(device) = bus.device(device_id) {
                return Some((bus, device));
            }
        }
        None
    }

    fn live_device(&self, device_id: DeviceId) -> Result<(Arc<Bus>, Arc<Device>)> {
        let (bus, device) = self
            .find_device(device_id)
            .ok_or(UsbError::InvalidArgument)?;
        if device.state.lock().lifecycle == Lifecycle::Detached {
            return Err(UsbError::AlreadyDisconnected);
        }
        Ok((bus, device))
    }

    /// Brings a host controller under management: initializes the hardware,
    /// sizes the bandwidth budget from the controller speed and enumerates
    /// the root hub. On any failure the bus slot is released again.
    pub async fn add_controller(&self, mut controller: Box<dyn Controller>) -> Result<BusId> {
        controller.init()?;
        let speed = controller.speed();
        if speed == DeviceSpeed::Low || speed == DeviceSpeed::Wireless {
            return Err(UsbError::InvalidSpeed);
        }
        let total_bandwidth = match speed {
            DeviceSpeed::Low | DeviceSpeed::Full => USB1_BANDWIDTH,
            _ => USB2_BANDWIDTH,
        };

        let bus_id = BusId::from(self.next_bus_id.fetch_add(1, Ordering::Relaxed));
        let bus = Arc::new(Bus::new(bus_id, controller, total_bandwidth));
        self.buses.lock().insert(bus_id, bus);
        info!("bus {bus_id}: controller added, budget {total_bandwidth} µs");

        match self.enumerate_device(bus_id, None, 0, speed).await {
            Ok(_) => Ok(bus_id),
            Err(err) => {
                warn!("bus {bus_id}: root hub enumeration failed: {err}");
                self.buses.lock().remove(&bus_id);
                Err(err)
            }
        }
    }

    /// Removes a controller, deenumerating its whole device topology
    /// newest-first with the root hub last.
    pub async fn remove_controller(&self, bus_id: BusId) -> Result<()> {
        let bus = self.find_bus(bus_id)?;

        loop {
            let next = {
                let registry = bus.registry.lock();
                let root = registry.root_hub;
                registry
                    .devices
                    .values()
                    .rev()
                    .find(|device| Some(device.id) != root)
                    .cloned()
                    .or_else(|| root.and_then(|id| registry.devices.get(&id).cloned()))
            };
            let Some(device) = next else {
                break;
            };
            let removing_root = device.is_root_hub();
            let device_id = device.id;
            if let Err(err) = self.deenumerate_inner(&bus, device, removing_root).await {
                warn!("bus {bus_id}: teardown of device {device_id} reported {err}");
                bus.registry.lock().devices.remove(&device_id);
            }
        }

        self.buses.lock().remove(&bus_id);
        info!("bus {bus_id}: controller removed");
        Ok(())
    }

    /// Deenumerates a device on disconnect. Calling it twice yields
    /// `AlreadyDisconnected` the second time with no further mutation.
    pub async fn deenumerate_device(&self, device_id: DeviceId) -> Result<()> {
        let (bus, device) = self
            .find_device(device_id)
            .ok_or(UsbError::AlreadyDisconnected)?;
        self.deenumerate_inner(&bus, device, false).await
    }

    /// Registers a driver at its score-derived priority and immediately
    /// offers currently-unclaimed devices to it.
    pub async fn register_driver(&self, driver: Arc<dyn ClassDriver>) -> Result<()> {
        let cursor = self.drivers.register(driver)?;
        self.attempt_unclaimed_devices(cursor).await;
        Ok(())
    }

    /// Only a driver with no live bindings may deregister.
    pub fn deregister_driver(&self, driver: &Arc<dyn ClassDriver>) -> Result<()> {
        if self.any_claimed_device(driver) {
            return Err(UsbError::InvalidArgument);
        }
        self.drivers.deregister(driver)
    }

    /// Selects the configuration with the given bConfigurationValue;
    /// 0 un-configures. A different active configuration is released
    /// first.
    pub async fn set_configuration(&self, device_id: DeviceId, value: u8) -> Result<()> {
        let (bus, device) = self.live_device(device_id)?;

        if value == 0 {
            return self.unset_config_inner(&bus, &device).await;
        }

        let index = device
            .state
            .lock()
            .config_index_by_value(value)
            .ok_or(UsbError::InvalidArgument)?;

        if let Some(active) = device.state.lock().active_config {
            if active == index {
                return Ok(());
            }
            self.unset_config_inner(&bus, &device).await?;
        }
        self.set_config_inner(&bus, &device, index).await
    }

    /// bConfigurationValue of the active configuration, from local state.
    pub fn active_configuration(&self, device_id: DeviceId) -> Result<Option<u8>> {
        let (_, device) = self.live_device(device_id)?;
        let state = device.state.lock();
        Ok(state
            .active_configuration()
            .map(|config| config.descriptor.configuration_value))
    }

    /// GET_CONFIGURATION on the wire.
    pub async fn get_configuration(&self, device_id: DeviceId) -> Result<u8> {
        let (bus, device) = self.live_device(device_id)?;
        let setup = SetupPacket::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Device,
            Request::GetConfiguration,
            0,
            0,
            1,
        );
        let (data, len) = control_in(&bus, self.kernel(), device.address(), setup, false).await;
        if len < 1 {
            return Err(UsbError::TransferFailed);
        }
        Ok(data[0])
    }

    /// Switches an interface to another alternate setting, diffing the
    /// endpoint sets so unchanged pipes stay open.
    pub async fn set_interface(
        &self,
        device_id: DeviceId,
        interface_number: u8,
        alt_setting: u8,
    ) -> Result<()> {
        let (bus, device) = self.live_device(device_id)?;
        let (config_index, intf_index) = {
            let state = device.state.lock();
            let config_index = state.active_config.ok_or(UsbError::InvalidArgument)?;
            let intf_index = state.configurations[config_index]
                .descriptor
                .interfaces
                .iter()
                .position(|intf| intf.interface_number == interface_number)
                .ok_or(UsbError::InvalidArgument)?;
            (config_index, intf_index)
        };
        self.set_interface_inner(&bus, &device, config_index, intf_index, alt_setting, true)
            .await
    }

    /// GET_INTERFACE on the wire.
    pub async fn get_interface(&self, device_id: DeviceId, interface_number: u8) -> Result<u8> {
        let (bus, device) = self.live_device(device_id)?;
        let setup = SetupPacket::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Interface,
            Request::GetInterface,
            0,
            interface_number as u16,
            1,
        );
        let (data, len) = control_in(&bus, self.kernel(), device.address(), setup, false).await;
        if len < 1 {
            return Err(UsbError::TransferFailed);
        }
        Ok(data[0])
    }

    async fn feature_request(
        &self,
        device_id: DeviceId,
        recipient: Recipient,
        set: bool,
        selector: u16,
        index: u16,
    ) -> Result<()> {
        let (bus, device) = self.live_device(device_id)?;
        let request = if set {
            Request::SetFeature
        } else {
            Request::ClearFeature
        };
        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Standard,
            recipient,
            request,
            selector,
            index,
            0,
        );
        if control_no_data(&bus, self.kernel(), device.address(), setup).await == 0 {
            return Err(UsbError::TransferFailed);
        }
        Ok(())
    }

    /// SET_FEATURE(ENDPOINT_HALT): parks the endpoint in the halted state.
    pub async fn stall_endpoint(&self, device_id: DeviceId, endpoint_address: u8) -> Result<()> {
        self.feature_request(
            device_id,
            Recipient::Endpoint,
            true,
            feature::ENDPOINT_HALT,
            endpoint_address as u16,
        )
        .await
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT): recovers a stalled endpoint.
    pub async fn unstall_endpoint(&self, device_id: DeviceId, endpoint_address: u8) -> Result<()> {
        self.feature_request(
            device_id,
            Recipient::Endpoint,
            false,
            feature::ENDPOINT_HALT,
            endpoint_address as u16,
        )
        .await
    }

    async fn status_request(
        &self,
        device_id: DeviceId,
        recipient: Recipient,
        index: u16,
    ) -> Result<u16> {
        let (bus, device) = self.live_device(device_id)?;
        let setup = SetupPacket::new(
            Direction::In,
            RequestType::Standard,
            recipient,
            Request::GetStatus,
            0,
            index,
            2,
        );
        let (data, len) = control_in(&bus, self.kernel(), device.address(), setup, false).await;
        if len < 2 {
            return Err(UsbError::TransferFailed);
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    /// GET_STATUS(device): bit 0 self-powered, bit 1 remote wakeup.
    pub async fn device_status(&self, device_id: DeviceId) -> Result<u16> {
        self.status_request(device_id, Recipient::Device, 0).await
    }

    pub async fn interface_status(
        &self,
        device_id: DeviceId,
        interface_number: u8,
    ) -> Result<u16> {
        self.status_request(device_id, Recipient::Interface, interface_number as u16)
            .await
    }

    /// GET_STATUS(endpoint): bit 0 is the halt flag.
    pub async fn endpoint_status(
        &self,
        device_id: DeviceId,
        endpoint_address: u8,
    ) -> Result<u16> {
        self.status_request(device_id, Recipient::Endpoint, endpoint_address as u16)
            .await
    }

    /// Whether the endpoint is currently halted, per GET_STATUS.
    pub async fn is_endpoint_stalled(
        &self,
        device_id: DeviceId,
        endpoint_address: u8,
    ) -> Result<bool> {
        Ok(self.endpoint_status(device_id, endpoint_address).await? & 0x01 != 0)
    }

    /// SET/CLEAR_FEATURE(FUNCTION_SUSPEND) with the SuperSpeed
    /// suspend-options byte (bit 0 suspend, bit 1 remote-wake enable) in
    /// the high byte of wIndex.
    pub async fn function_suspend(
        &self,
        device_id: DeviceId,
        interface_number: u8,
        suspend: bool,
        remote_wake: bool,
    ) -> Result<()> {
        let mut options = 0u16;
        if suspend {
            options |= 0x01;
        }
        if remote_wake {
            options |= 0x02;
        }
        self.feature_request(
            device_id,
            Recipient::Interface,
            true,
            feature::FUNCTION_SUSPEND,
            interface_number as u16 | (options << 8),
        )
        .await
    }

    pub async fn u1_enable(&self, device_id: DeviceId) -> Result<()> {
        self.feature_request(device_id, Recipient::Device, true, feature::U1_ENABLE, 0)
            .await
    }

    pub async fn u1_disable(&self, device_id: DeviceId) -> Result<()> {
        self.feature_request(device_id, Recipient::Device, false, feature::U1_ENABLE, 0)
            .await
    }

    pub async fn u2_enable(&self, device_id: DeviceId) -> Result<()> {
        self.feature_request(device_id, Recipient::Device, true, feature::U2_ENABLE, 0)
            .await
    }

    pub async fn u2_disable(&self, device_id: DeviceId) -> Result<()> {
        self.feature_request(device_id, Recipient::Device, false, feature::U2_ENABLE, 0)
            .await
    }

    pub async fn ltm_enable(&self, device_id: DeviceId) -> Result<()> {
        self.feature_request(device_id, Recipient::Device, true, feature::LTM_ENABLE, 0)
            .await
    }

    pub async fn ltm_disable(&self, device_id: DeviceId) -> Result<()> {
        self.feature_request(device_id, Recipient::Device, false, feature::LTM_ENABLE, 0)
            .await
    }

    // Read-only views for drivers and diagnostics.

    pub fn device_descriptor(&self, device_id: DeviceId) -> Result<DeviceDescriptor> {
        let (_, device) = self.live_device(device_id)?;
        let state = device.state.lock();
        Ok(state.descriptor.clone())
    }

    pub fn configuration_descriptor(
        &self,
        device_id: DeviceId,
        index: usize,
    ) -> Result<ConfigurationDescriptor> {
        let (_, device) = self.live_device(device_id)?;
        let state = device.state.lock();
        state
            .configurations
            .get(index)
            .map(|config| config.descriptor.clone())
            .ok_or(UsbError::InvalidArgument)
    }

    /// The raw configuration descriptor buffer as returned by the device,
    /// for drivers that parse class-specific descriptors themselves.
    pub fn raw_configuration(&self, device_id: DeviceId, index: usize) -> Result<Vec<u8>> {
        let (_, device) = self.live_device(device_id)?;
        let state = device.state.lock();
        state
            .raw_configurations
            .get(index)
            .cloned()
            .ok_or(UsbError::InvalidArgument)
    }

    /// The raw BOS buffer of a SuperSpeed device, if one was fetched.
    pub fn raw_bos(&self, device_id: DeviceId) -> Result<Option<Vec<u8>>> {
        let (_, device) = self.live_device(device_id)?;
        Ok(device.state.lock().raw_bos.clone())
    }

    /// A cached string in the first language the device advertised.
    pub fn device_string(&self, device_id: DeviceId, index: u8) -> Result<Option<String>> {
        let (_, device) = self.live_device(device_id)?;
        let state = device.state.lock();
        let language = state.language_ids.first().copied().unwrap_or_default();
        Ok(state.string(index, language).map(String::from))
    }

    pub fn device_parent(&self, device_id: DeviceId) -> Result<Option<DeviceId>> {
        let (_, device) = self.live_device(device_id)?;
        Ok(device.parent())
    }

    pub fn devices_on_bus(&self, bus_id: BusId) -> Result<Vec<DeviceId>> {
        let bus = self.find_bus(bus_id)?;
        let registry = bus.registry.lock();
        Ok(registry.devices.keys().copied().collect())
    }

    pub fn root_hub(&self, bus_id: BusId) -> Result<Option<DeviceId>> {
        let bus = self.find_bus(bus_id)?;
        let root = bus.registry.lock().root_hub;
        Ok(root)
    }

    pub fn available_bandwidth(&self, bus_id: BusId) -> Result<u32> {
        let bus = self.find_bus(bus_id)?;
        let avail = bus.registry.lock().avail_bandwidth;
        Ok(avail)
    }

    pub fn total_bandwidth(&self, bus_id: BusId) -> Result<u32> {
        let bus = self.find_bus(bus_id)?;
        Ok(bus.total_bandwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockShared, alt_device_spec, stack_with_root};
    use spin_on::spin_on;

    fn enumerated_alt_device() -> (UsbHostStack, BusId, DeviceId, Arc<MockShared>) {
        let (stack, bus_id, mock) = stack_with_root();
        mock.attach(alt_device_spec());
        let root = stack.root_hub(bus_id).unwrap().unwrap();
        let device =
            spin_on(stack.enumerate_device(bus_id, Some(root), 1, DeviceSpeed::Full)).unwrap();
        (stack, bus_id, device, mock)
    }

    #[test]
    fn test_bandwidth_conservation_across_config_cycles() {
        let (stack, bus_id, device, _mock) = enumerated_alt_device();
        let total = stack.total_bandwidth(bus_id).unwrap();
        assert_eq!(stack.available_bandwidth(bus_id).unwrap(), total);

        for _ in 0..3 {
            spin_on(stack.set_configuration(device, 1)).unwrap();
            let avail = stack.available_bandwidth(bus_id).unwrap();
            let load = total - avail;
            assert!(load > 0);
            assert_eq!(avail + load, total);

            spin_on(stack.set_configuration(device, 0)).unwrap();
            assert_eq!(stack.available_bandwidth(bus_id).unwrap(), total);
        }

        // Unconfiguring twice must not double-credit.
        spin_on(stack.set_configuration(device, 0)).unwrap();
        assert_eq!(stack.available_bandwidth(bus_id).unwrap(), total);
    }

    #[test]
    fn test_no_bandwidth_rejects_without_wire_traffic() {
        let (stack, bus_id, device, mock) = enumerated_alt_device();
        stack
            .find_bus(bus_id)
            .unwrap()
            .registry
            .lock()
            .avail_bandwidth = 0;

        let requests_before = mock.requests_of(Request::SetConfiguration).len();
        assert_eq!(
            spin_on(stack.set_configuration(device, 1)),
            Err(UsbError::NoBandwidth)
        );
        assert_eq!(
            mock.requests_of(Request::SetConfiguration).len(),
            requests_before
        );
        assert_eq!(stack.available_bandwidth(bus_id).unwrap(), 0);
        assert_eq!(stack.active_configuration(device).unwrap(), None);
    }

    #[test]
    fn test_interface_diff_leaves_unchanged_pipes_alone() {
        let (stack, _bus_id, device, mock) = enumerated_alt_device();
        spin_on(stack.set_configuration(device, 1)).unwrap();
        let address = mock.set_addresses()[0];
        assert!(mock.open_pipe_set().contains(&(address, 0x81)));
        assert!(mock.open_pipe_set().contains(&(address, 0x02)));

        let closed_before = mock.closed_pipes().len();
        let opened_before = mock.opened_pipes().len();

        spin_on(stack.set_interface(device, 0, 1)).unwrap();

        // 0x81 is identical in both settings: never closed, never reopened.
        let closed: Vec<(u8, u8)> = mock.closed_pipes()[closed_before..].to_vec();
        assert_eq!(closed, alloc::vec![(address, 0x02)]);
        let opened: Vec<_> = mock.opened_pipes()[opened_before..].to_vec();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].endpoint_address, 0x03);
        assert!(mock.modified_pipes().is_empty());
        assert!(mock.open_pipe_set().contains(&(address, 0x81)));

        // alt 1 → alt 2: 0x81 changes packet size, so it is modified in
        // place; 0x03 departs.
        spin_on(stack.set_interface(device, 0, 2)).unwrap();
        let modified = mock.modified_pipes();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].endpoint_address, 0x81);
        assert_eq!(modified[0].max_packet_size, 16);
        assert!(!mock.open_pipe_set().contains(&(address, 0x03)));
        assert!(mock.open_pipe_set().contains(&(address, 0x81)));
    }

    #[test]
    fn test_set_interface_tolerates_stall() {
        let (stack, bus_id, mock) = stack_with_root();
        let mut spec = alt_device_spec();
        spec.stall_set_interface = true;
        mock.attach(spec);
        let root = stack.root_hub(bus_id).unwrap().unwrap();
        let device =
            spin_on(stack.enumerate_device(bus_id, Some(root), 1, DeviceSpeed::Full)).unwrap();
        spin_on(stack.set_configuration(device, 1)).unwrap();
        let address = mock.set_addresses()[0];

        // The device stalls SET_INTERFACE; the hardware diff proceeds
        // anyway.
        spin_on(stack.set_interface(device, 0, 1)).unwrap();
        assert!(mock.open_pipe_set().contains(&(address, 0x03)));
        assert!(!mock.open_pipe_set().contains(&(address, 0x02)));
    }

    #[test]
    fn test_wire_status_and_feature_encodings() {
        let (stack, _bus_id, device, mock) = enumerated_alt_device();

        assert_eq!(spin_on(stack.device_status(device)).unwrap(), 0);
        assert!(!spin_on(stack.is_endpoint_stalled(device, 0x81)).unwrap());

        spin_on(stack.stall_endpoint(device, 0x81)).unwrap();
        let mut sets = mock.requests_of(Request::SetFeature);
        let (_, halt) = sets.pop().unwrap();
        assert_eq!(halt.value, feature::ENDPOINT_HALT);
        assert_eq!(halt.index, 0x81);

        spin_on(stack.unstall_endpoint(device, 0x81)).unwrap();
        let mut clears = mock.requests_of(Request::ClearFeature);
        let (_, unhalt) = clears.pop().unwrap();
        assert_eq!(unhalt.index, 0x81);

        // Function suspend carries the suspend options in the high byte of
        // wIndex.
        spin_on(stack.function_suspend(device, 0, true, true)).unwrap();
        let mut sets = mock.requests_of(Request::SetFeature);
        let (_, suspend) = sets.pop().unwrap();
        assert_eq!(suspend.value, feature::FUNCTION_SUSPEND);
        assert_eq!(suspend.index, 0x0300);

        spin_on(stack.u1_enable(device)).unwrap();
        let mut sets = mock.requests_of(Request::SetFeature);
        let (_, u1) = sets.pop().unwrap();
        assert_eq!(u1.value, feature::U1_ENABLE);
    }

    #[test]
    fn test_remove_controller_tears_down_topology() {
        let (stack, bus_id, device, mock) = enumerated_alt_device();
        spin_on(stack.set_configuration(device, 1)).unwrap();

        spin_on(stack.remove_controller(bus_id)).unwrap();

        assert!(mock.open_pipe_set().is_empty());
        assert_eq!(stack.find_bus(bus_id).err(), Some(UsbError::InvalidArgument));
        assert_eq!(
            spin_on(stack.deenumerate_device(device)),
            Err(UsbError::AlreadyDisconnected)
        );
    }

    #[test]
    fn test_wire_get_configuration_and_interface() {
        let (stack, _bus_id, device, _mock) = enumerated_alt_device();
        spin_on(stack.set_configuration(device, 1)).unwrap();
        assert_eq!(spin_on(stack.get_configuration(device)).unwrap(), 1);
        assert_eq!(spin_on(stack.get_interface(device, 0)).unwrap(), 0);
    }
}
