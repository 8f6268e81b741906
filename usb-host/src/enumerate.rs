//! Enumeration State Machine and its mirror image, the Deenumeration
//! Engine.
//!
//! Enumeration is a strictly forward sequence; every failure runs an
//! explicit undo stack covering exactly the resources acquired so far, so
//! an error return leaves the bus registry byte-identical to its state
//! before the attempt.

use alloc::{sync::Arc, vec::Vec};
use core::time::Duration;

use log::{debug, info, warn};

use coral_usb_if::descriptor::{
    BosDescriptor, DeviceDescriptor, EndpointType, LanguageId, SpeedsSupported,
};
use coral_usb_if::err::{Result, UsbError};
use coral_usb_if::host::{DeviceSpeed, PipeConfig};
use coral_usb_if::transfer::{Direction, Recipient, Request, RequestType, SetupPacket, feature};
use coral_usb_if::DrMode;

use crate::DeviceId;
use crate::bus::{Bus, DEFAULT_ADDRESS, ROOT_HUB_ADDRESS};
use crate::control::{DEFAULT_PIPE_ENDPOINT, control_no_data, control_out};
use crate::device::{CachedString, Configuration, Device, Lifecycle};
use crate::driver::ClassDriver;
use crate::fetch::Fetcher;
use crate::stack::{StatusReport, UsbHostStack};

/// Sanity cap on bNumConfigurations; a device claiming more is lying.
const MAX_CONFIGURATIONS: usize = 8;

/// Recovery interval after SET_ADDRESS, USB 2.0 §9.2.6.3.
const SET_ADDRESS_SETTLE: Duration = Duration::from_millis(2);

/// Nominal isochronous forwarding delay per hub tier, ns.
const HUB_FORWARD_DELAY_NS: u16 = 40;

/// One entry of the enumeration undo stack.
enum UndoStep {
    /// Close the default pipe opened at `address`.
    ClosePipe { address: u8 },
    /// Remove the device from the registry and release its address bit.
    Unlink {
        device: DeviceId,
        address: u8,
        root_hub: bool,
    },
}

/// LIFO stack of undo actions pushed as resources are acquired. `unwind`
/// runs them newest-first: the default pipe closes before the address is
/// released, the address after the device left the list.
#[derive(Default)]
struct Rollback {
    steps: Vec<UndoStep>,
}

impl Rollback {
    fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    /// Drops the pipe-close step for `address` once the engine has closed
    /// that pipe itself (address relocation).
    fn forget_pipe(&mut self, address: u8) {
        self.steps.retain(
            |step| !matches!(step, UndoStep::ClosePipe { address: a } if *a == address),
        );
    }

    fn disarm(&mut self) {
        self.steps.clear();
    }

    fn unwind(self, bus: &Arc<Bus>) {
        for step in self.steps.into_iter().rev() {
            match step {
                UndoStep::ClosePipe { address } => {
                    if let Err(err) =
                        bus.with_controller(|c| c.close_pipe(address, DEFAULT_PIPE_ENDPOINT))
                    {
                        warn!("rollback: closing default pipe of {address} failed: {err}");
                    }
                }
                UndoStep::Unlink {
                    device,
                    address,
                    root_hub,
                } => {
                    let mut registry = bus.registry.lock();
                    registry.devices.remove(&device);
                    if root_hub {
                        registry.root_hub = None;
                    } else {
                        registry.addresses.release(address);
                    }
                }
            }
        }
    }
}

fn default_pipe(address: u8, speed: DeviceSpeed, max_packet_size: u16) -> PipeConfig {
    PipeConfig {
        device_address: address,
        endpoint_address: DEFAULT_PIPE_ENDPOINT,
        transfer_type: EndpointType::Control,
        speed,
        max_packet_size,
        interval_us: 0,
        load: 0,
    }
}

impl UsbHostStack {
    /// Takes a newly detected device through addressing, descriptor
    /// discovery, configuration and driver binding. `parent` is `None` for
    /// a root hub. Returns the registry handle of the fully enumerated
    /// device; on error every acquired resource has been released.
    pub async fn enumerate_device(
        &self,
        bus_id: crate::BusId,
        parent: Option<DeviceId>,
        port_number: u8,
        speed: DeviceSpeed,
    ) -> Result<DeviceId> {
        let bus = self.find_bus(bus_id)?;

        if speed == DeviceSpeed::Wireless || (parent.is_none() && speed == DeviceSpeed::Low) {
            self.report(&StatusReport::EnumerationFailed {
                bus: bus_id,
                port: port_number,
                error: UsbError::InvalidSpeed,
            });
            return Err(UsbError::InvalidSpeed);
        }
        if let Some(parent_id) = parent {
            let parent_dev = bus.device(parent_id).ok_or(UsbError::InvalidArgument)?;
            if parent_dev.state.lock().lifecycle == Lifecycle::Detached {
                return Err(UsbError::InvalidArgument);
            }
        }

        let mut rollback = Rollback::default();
        match self
            .enumerate_steps(&bus, &mut rollback, parent, port_number, speed)
            .await
        {
            Ok(device_id) => Ok(device_id),
            Err(error) => {
                warn!("enumeration on bus {bus_id} port {port_number} failed: {error}");
                rollback.unwind(&bus);
                self.report(&StatusReport::EnumerationFailed {
                    bus: bus_id,
                    port: port_number,
                    error,
                });
                Err(error)
            }
        }
    }

    async fn enumerate_steps(
        &self,
        bus: &Arc<Bus>,
        rollback: &mut Rollback,
        parent: Option<DeviceId>,
        port_number: u8,
        speed: DeviceSpeed,
    ) -> Result<DeviceId> {
        let root_hub = parent.is_none();
        let device_id = self.next_device_id();

        // AllocatingRecord. The record stays local until it is linked into
        // the registry; dropping it on an early error frees everything it
        // caches.
        let initial_address = if root_hub {
            ROOT_HUB_ADDRESS
        } else {
            DEFAULT_ADDRESS
        };
        let device = Arc::new(Device::new(
            device_id,
            bus.id,
            speed,
            parent,
            port_number,
            initial_address,
        ));

        // OpeningDefaultPipe. The root hub's default pipe is emulated by
        // the controller; it is registered directly under its reserved
        // address instead.
        if root_hub {
            let mut registry = bus.registry.lock();
            registry.devices.insert(device_id, device.clone());
            registry.root_hub = Some(device_id);
            rollback.push(UndoStep::Unlink {
                device: device_id,
                address: ROOT_HUB_ADDRESS,
                root_hub: true,
            });
        } else {
            bus.with_controller(|c| c.open_pipe(&default_pipe(DEFAULT_ADDRESS, speed, 8)))?;
            rollback.push(UndoStep::ClosePipe {
                address: DEFAULT_ADDRESS,
            });
        }

        // FetchingDevice8: learn the true default-pipe packet size over the
        // 8-byte pipe, then tell the controller.
        let prefix = Fetcher {
            bus,
            kernel: self.kernel(),
            address: device.address(),
            max_packet_size0: 8,
        }
        .device_prefix()
        .await?;
        let mps0 = prefix.max_packet_size0_bytes();
        bus.with_controller(|c| c.update_max_packet_size(device.address(), mps0))?;

        // AssigningAddress (skipped for the root hub).
        if !root_hub {
            self.assign_address(bus, rollback, &device, speed, mps0).await?;
        }

        let address = device.address();
        let fetcher = Fetcher {
            bus,
            kernel: self.kernel(),
            address,
            max_packet_size0: mps0,
        };

        // FetchingDeviceFull.
        let descriptor = fetcher.device_full().await?;
        if descriptor.num_configurations == 0
            || descriptor.num_configurations as usize > MAX_CONFIGURATIONS
        {
            return Err(UsbError::InvalidDescriptor);
        }
        device.state.lock().descriptor = descriptor.clone();
        debug!(
            "device {device_id}: {:04x}:{:04x} at address {address}",
            descriptor.vendor_id, descriptor.product_id
        );

        // FetchingStrings. Individual failures are recorded as absent.
        self.fetch_device_strings(&fetcher, &device).await;

        // FetchingOptionalExtensions, SuperSpeed only. The BOS descriptor
        // is mandatory there; the PM preamble is best-effort.
        if matches!(
            speed,
            DeviceSpeed::SuperSpeed | DeviceSpeed::SuperSpeedPlus
        ) && descriptor.usb_release >= 0x0300
        {
            let bos = self.fetch_bos(&fetcher, &device, speed).await?;
            self.set_isochronous_delay(bus, &device).await;
            self.set_system_exit_latency(bus, &device, &bos).await;
        }

        // FetchingConfigurations.
        self.fetch_configurations(&fetcher, bus, &device, &descriptor).await?;

        // Everything the undo stack covers is now owned by the registry
        // entry; driver binding failures no longer tear the device down.
        rollback.disarm();

        // BindingDriver: vendor drivers get first refusal on the whole
        // device, standard drivers go per-interface. An unclaimed device
        // stays enumerated and idle.
        if self.bind_vendor_driver(&device, 0, false).await.is_none() {
            match self.bind_standard_driver(bus, &device).await {
                Ok(()) => {}
                Err(err) => {
                    if err != UsbError::Unavailable {
                        warn!("device {device_id}: driver binding failed: {err}");
                    }
                    info!("device {device_id}: no driver claimed it, leaving unconfigured");
                    self.report(&StatusReport::UnsupportedDevice {
                        bus: bus.id,
                        vendor_id: descriptor.vendor_id,
                        product_id: descriptor.product_id,
                    });
                }
            }
        }

        info!("device {device_id}: enumeration complete");
        Ok(device_id)
    }

    /// The address-assignment sub-protocol: draw a free address, make the
    /// device visible in the registry, SET_ADDRESS, observe the settle
    /// interval, then move the default pipe to the assigned address.
    async fn assign_address(
        &self,
        bus: &Arc<Bus>,
        rollback: &mut Rollback,
        device: &Arc<Device>,
        speed: DeviceSpeed,
        mps0: u16,
    ) -> Result<()> {
        let address = {
            let mut registry = bus.registry.lock();
            let address = registry.addresses.allocate().ok_or(UsbError::NoFreeAddress)?;
            registry.devices.insert(device.id, device.clone());
            address
        };
        rollback.push(UndoStep::Unlink {
            device: device.id,
            address,
            root_hub: false,
        });

        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SetAddress,
            address as u16,
            0,
            0,
        );
        if control_no_data(bus, self.kernel(), DEFAULT_ADDRESS, setup).await == 0 {
            return Err(UsbError::TransferFailed);
        }

        self.kernel().delay(SET_ADDRESS_SETTLE);

        {
            let mut state = device.state.lock();
            state.address = address;
            state.lifecycle = Lifecycle::Addressed;
        }

        // Re-home the default pipe: close at address 0, reopen at the
        // assigned address with the discovered packet size.
        if let Err(err) =
            bus.with_controller(|c| c.close_pipe(DEFAULT_ADDRESS, DEFAULT_PIPE_ENDPOINT))
        {
            warn!("closing address-0 pipe failed: {err}");
        }
        rollback.forget_pipe(DEFAULT_ADDRESS);
        bus.with_controller(|c| c.open_pipe(&default_pipe(address, speed, mps0)))?;
        rollback.push(UndoStep::ClosePipe { address });

        debug!("device {}: address {address} assigned", device.id);
        Ok(())
    }

    /// Language table first, then the device-level strings. Nothing here is
    /// fatal; a string that cannot be fetched is simply absent.
    async fn fetch_device_strings(&self, fetcher: &Fetcher<'_>, device: &Arc<Device>) {
        let descriptor = device.state.lock().descriptor.clone();
        let indexes = [
            descriptor.manufacturer_string_index,
            descriptor.product_string_index,
            descriptor.serial_number_string_index,
        ];
        if indexes.iter().all(|&index| index == 0) {
            return;
        }

        let languages = match fetcher.language_table().await {
            Ok(languages) if !languages.is_empty() => languages,
            Ok(_) => {
                debug!("device {}: empty language table", device.id);
                return;
            }
            Err(err) => {
                debug!("device {}: language table unavailable: {err}", device.id);
                return;
            }
        };
        device.state.lock().language_ids = languages.clone();

        for index in indexes {
            if index != 0 {
                self.fetch_string_into(fetcher, device, index, &languages).await;
            }
        }
    }

    async fn fetch_string_into(
        &self,
        fetcher: &Fetcher<'_>,
        device: &Arc<Device>,
        index: u8,
        languages: &[LanguageId],
    ) {
        if device.state.lock().has_string(index) {
            return;
        }
        for &language in languages {
            match fetcher.string(index, language).await {
                Ok(text) => {
                    device.state.lock().strings.push(CachedString {
                        index,
                        language,
                        text,
                    });
                }
                Err(err) => {
                    debug!(
                        "device {}: string {index} lang {:04x} absent: {err}",
                        device.id,
                        u16::from(language)
                    );
                }
            }
        }
    }

    /// Mandatory BOS fetch for SuperSpeed devices; the capability must
    /// advertise the speed the link actually trained at.
    async fn fetch_bos(
        &self,
        fetcher: &Fetcher<'_>,
        device: &Arc<Device>,
        speed: DeviceSpeed,
    ) -> Result<BosDescriptor> {
        let (bos, raw) = fetcher.bos().await?;
        let supported = bos
            .superspeed()
            .map(|ss| ss.speeds_supported.contains(SpeedsSupported::GEN1))
            .unwrap_or(false);
        if !supported && speed >= DeviceSpeed::SuperSpeed {
            return Err(UsbError::InvalidSpeed);
        }
        let mut state = device.state.lock();
        state.bos = Some(bos.clone());
        state.raw_bos = Some(raw);
        Ok(bos)
    }

    /// SET_ISOCH_DELAY with the accumulated forwarding delay of the hub
    /// chain above the device. Best-effort.
    async fn set_isochronous_delay(&self, bus: &Arc<Bus>, device: &Arc<Device>) {
        let mut hops = 0u16;
        {
            let registry = bus.registry.lock();
            let mut cursor = device.parent;
            while let Some(parent_id) = cursor {
                hops += 1;
                cursor = registry.devices.get(&parent_id).and_then(|d| d.parent);
            }
        }
        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SetIsochDelay,
            hops * HUB_FORWARD_DELAY_NS,
            0,
            0,
        );
        if control_no_data(bus, self.kernel(), device.address(), setup).await == 0 {
            debug!("device {}: SET_ISOCH_DELAY not acknowledged", device.id);
        }
    }

    /// SET_SEL carrying the exit latencies the device reported in its
    /// SuperSpeed capability. Best-effort.
    async fn set_system_exit_latency(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        bos: &BosDescriptor,
    ) {
        let (u1, u2) = bos
            .superspeed()
            .map(|ss| (ss.u1_exit_latency, ss.u2_exit_latency))
            .unwrap_or((0, 0));
        let data = alloc::vec![
            u1,
            u1,
            (u2 & 0xff) as u8,
            (u2 >> 8) as u8,
            (u2 & 0xff) as u8,
            (u2 >> 8) as u8,
        ];
        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SetSel,
            0,
            0,
            data.len() as u16,
        );
        if control_out(bus, self.kernel(), device.address(), setup, data).await == 0 {
            debug!("device {}: SET_SEL not acknowledged", device.id);
        }
    }

    /// Fetches and parses every declared configuration, pulling in the
    /// configuration- and interface-level strings along the way, and runs
    /// the OTG handshake where a configuration advertises HNP.
    async fn fetch_configurations(
        &self,
        fetcher: &Fetcher<'_>,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        descriptor: &DeviceDescriptor,
    ) -> Result<()> {
        let languages = device.state.lock().language_ids.clone();

        for index in 0..descriptor.num_configurations {
            let (config, raw) = fetcher.configuration(index).await?;

            if !languages.is_empty() {
                if config.string_index != 0 {
                    self.fetch_string_into(fetcher, device, config.string_index, &languages)
                        .await;
                }
                for interface in &config.interfaces {
                    for alt in &interface.alt_settings {
                        if alt.string_index != 0 {
                            self.fetch_string_into(fetcher, device, alt.string_index, &languages)
                                .await;
                        }
                    }
                }
            }

            if config.otg.is_some_and(|otg| otg.hnp_capable) {
                self.negotiate_hnp(bus, device).await;
            }

            let mut state = device.state.lock();
            state.configurations.push(Configuration::new(config));
            state.raw_configurations.push(raw);
        }
        Ok(())
    }

    /// Tells an HNP-capable device that the port supports HNP. Failure is
    /// absorbed; OTG negotiation is cosmetic for enumeration purposes.
    async fn negotiate_hnp(&self, bus: &Arc<Bus>, device: &Arc<Device>) {
        match bus.with_controller(|c| c.get_role(device.port_number)) {
            Ok(DrMode::Otg) => {
                let setup = SetupPacket::new(
                    Direction::Out,
                    RequestType::Standard,
                    Recipient::Device,
                    Request::SetFeature,
                    feature::A_HNP_SUPPORT,
                    0,
                    0,
                );
                if control_no_data(bus, self.kernel(), device.address(), setup).await == 0 {
                    debug!("device {}: A_HNP_SUPPORT not acknowledged", device.id);
                }
            }
            Ok(_) => {}
            Err(_) => {}
        }
    }

    /// Mirror-image teardown. Driver notification first, then pipes, then
    /// descriptor memory, then (under the bus-wide lock) address and list
    /// membership. Secondary errors are logged and never stop the ladder;
    /// the address and list release always complete.
    pub(crate) async fn deenumerate_inner(
        &self,
        bus: &Arc<Bus>,
        device: Arc<Device>,
        removing_root: bool,
    ) -> Result<()> {
        debug_assert_eq!(device.bus, bus.id);

        // Idempotence guard: check-and-mark under the device lock.
        {
            let mut state = device.state.lock();
            if state.lifecycle == Lifecycle::Detached {
                return Err(UsbError::AlreadyDisconnected);
            }
            state.lifecycle = Lifecycle::Detached;
        }
        info!("device {}: deenumerating", device.id);

        let (vendor, interface_drivers, address, active_config) = {
            let state = device.state.lock();
            let interface_drivers: Vec<Arc<dyn ClassDriver>> = match state.active_config {
                Some(index) => state.configurations[index]
                    .interfaces
                    .iter()
                    .filter_map(|intf| intf.driver.clone())
                    .collect(),
                None => Vec::new(),
            };
            (
                state.vendor_driver.clone(),
                interface_drivers,
                state.address,
                state.active_config,
            )
        };

        // Disconnect notification precedes every pipe closure.
        if let Some(driver) = vendor {
            if let Err(err) = driver.disconnect(self, device.id).await {
                warn!(
                    "device {}: driver {} disconnect failed: {err}",
                    device.id,
                    driver.name()
                );
            }
        } else {
            for driver in interface_drivers {
                if let Err(err) = driver.disconnect(self, device.id).await {
                    warn!(
                        "device {}: driver {} disconnect failed: {err}",
                        device.id,
                        driver.name()
                    );
                }
            }
        }

        // Close the configuration's pipes and credit its bandwidth back.
        if let Some(config_index) = active_config {
            let load = self.close_config_pipes(bus, &device, config_index);
            bus.registry.lock().avail_bandwidth += load;
            device.state.lock().active_config = None;
        }
        // And the default pipe.
        if !device.is_root_hub() {
            if let Err(err) = bus.with_controller(|c| c.close_pipe(address, DEFAULT_PIPE_ENDPOINT))
            {
                warn!("device {}: closing default pipe failed: {err}", device.id);
            }
        }

        // Descriptor memory goes before the record itself.
        device.state.lock().release_descriptor_caches();

        let power_down = {
            let mut registry = bus.registry.lock();
            if !device.is_root_hub() {
                registry.addresses.release(address);
            }
            registry.devices.remove(&device.id);
            if registry.root_hub == Some(device.id) {
                registry.root_hub = None;
            }
            // Last device out (root hub aside) turns the lights off.
            !removing_root
                && registry.devices.len() == 1
                && registry
                    .root_hub
                    .is_some_and(|id| registry.devices.contains_key(&id))
        };
        if power_down {
            bus.with_controller(|c| c.request_power_down());
        }

        info!("device {}: deenumeration complete", device.id);
        Ok(())
    }
}
