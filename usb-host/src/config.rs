//! Configuration Lifecycle Manager: realizes SET_CONFIGURATION and
//! SET_INTERFACE transitions in the hardware, diffing endpoint sets so
//! unaffected pipes are left alone.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};

use coral_usb_if::descriptor::EndpointDescriptor;
use coral_usb_if::err::{Result, UsbError};
use coral_usb_if::host::{DeviceSpeed, PipeConfig};
use coral_usb_if::transfer::{Direction, Recipient, Request, RequestType, SetupPacket};

use crate::bandwidth::{
    configuration_load, effective_packet_size, endpoint_load, interval_to_microseconds,
};
use crate::bus::Bus;
use crate::control::control_no_data;
use crate::device::{Device, Lifecycle};
use crate::stack::UsbHostStack;

fn pipe_config(address: u8, speed: DeviceSpeed, ep: &EndpointDescriptor) -> PipeConfig {
    PipeConfig {
        device_address: address,
        endpoint_address: ep.address,
        transfer_type: ep.transfer_type,
        speed,
        max_packet_size: effective_packet_size(ep.max_packet_size),
        interval_us: interval_to_microseconds(ep.interval, ep.transfer_type, speed),
        load: endpoint_load(speed, ep),
    }
}

fn same_pipe_attributes(a: &EndpointDescriptor, b: &EndpointDescriptor) -> bool {
    a.transfer_type == b.transfer_type
        && a.max_packet_size == b.max_packet_size
        && a.interval == b.interval
}

impl UsbHostStack {
    /// Admission control, SET_CONFIGURATION and pipe setup for the
    /// configuration at `config_index`. The bandwidth debit happens before
    /// the wire request and is credited back on every failure path, so the
    /// budget never leaks and is never touched on a `NoBandwidth` reject.
    pub(crate) async fn set_config_inner(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        config_index: usize,
    ) -> Result<()> {
        let (address, speed, config_value, max_power, descriptor) = {
            let state = device.state.lock();
            let config = state
                .configurations
                .get(config_index)
                .ok_or(UsbError::InvalidArgument)?;
            (
                state.address,
                device.speed,
                config.descriptor.configuration_value,
                config.descriptor.max_power,
                config.descriptor.clone(),
            )
        };

        if !bus.with_controller(|c| c.current_available(address, max_power)) {
            return Err(UsbError::NoPower);
        }

        let total_load = configuration_load(speed, &descriptor);
        {
            let mut registry = bus.registry.lock();
            if registry.avail_bandwidth < total_load {
                return Err(UsbError::NoBandwidth);
            }
            registry.avail_bandwidth -= total_load;
        }

        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SetConfiguration,
            config_value as u16,
            0,
            0,
        );
        if control_no_data(bus, self.kernel(), address, setup).await == 0 {
            bus.registry.lock().avail_bandwidth += total_load;
            return Err(UsbError::TransferFailed);
        }

        // Open the pipes of every interface's default alternate setting.
        for intf_index in 0..descriptor.interfaces.len() {
            let default_alt = descriptor.interfaces[intf_index].alt_settings[0].alternate_setting;
            if let Err(err) = self
                .set_interface_inner(bus, device, config_index, intf_index, default_alt, false)
                .await
            {
                warn!(
                    "device {}: pipe setup for interface index {intf_index} failed: {err}",
                    device.id
                );
                self.close_interface_pipes(bus, device, config_index, intf_index);
                bus.registry.lock().avail_bandwidth += total_load;
                return Err(err);
            }
        }

        let mut state = device.state.lock();
        if let Some(previous) = state.active_config {
            state.configurations[previous].is_active = false;
        }
        let config = &mut state.configurations[config_index];
        config.load = total_load;
        config.is_active = true;
        state.active_config = Some(config_index);
        state.lifecycle = Lifecycle::Configured;
        debug!(
            "device {}: configuration {config_value} active, {total_load} µs debited",
            device.id
        );
        Ok(())
    }

    /// Closes every pipe opened for interfaces `0..=up_to` of the given
    /// configuration. Used to back out of a partially-realized
    /// SET_CONFIGURATION.
    fn close_interface_pipes(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        config_index: usize,
        up_to: usize,
    ) {
        let address = device.address();
        let mut state = device.state.lock();
        let config = &mut state.configurations[config_index];
        for intf_index in 0..config.interfaces.len().min(up_to + 1) {
            let Some(current) = config.interfaces[intf_index].current.take() else {
                continue;
            };
            if let Some(alt) = config.descriptor.interfaces[intf_index].alt_setting(current) {
                for ep in &alt.endpoints {
                    let _ = bus.with_controller(|c| c.close_pipe(address, ep.address));
                }
            }
        }
    }

    /// Releases the power reservation, closes the active configuration's
    /// pipes, un-configures the device on the wire and credits the
    /// bandwidth back exactly once. A second call is a no-op.
    pub(crate) async fn unset_config_inner(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
    ) -> Result<()> {
        let (address, config_index) = {
            let state = device.state.lock();
            match state.active_config {
                Some(index) => (state.address, index),
                None => return Ok(()),
            }
        };

        bus.with_controller(|c| c.release_power(address));

        let load = self.close_config_pipes(bus, device, config_index);
        bus.registry.lock().avail_bandwidth += load;

        let setup = SetupPacket::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            Request::SetConfiguration,
            0,
            0,
            0,
        );
        // The device may already be gone; the local state is authoritative.
        if control_no_data(bus, self.kernel(), address, setup).await == 0 {
            debug!("device {}: SET_CONFIGURATION(0) not acknowledged", device.id);
        }

        let mut state = device.state.lock();
        state.active_config = None;
        if state.lifecycle == Lifecycle::Configured {
            state.lifecycle = Lifecycle::Addressed;
        }
        Ok(())
    }

    /// Closes every open pipe of the configuration and zeroes its load,
    /// returning the µs to credit back. Leaves the wire state untouched.
    pub(crate) fn close_config_pipes(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        config_index: usize,
    ) -> u32 {
        let address = device.address();
        let mut state = device.state.lock();
        let config = &mut state.configurations[config_index];
        for intf_index in 0..config.interfaces.len() {
            let Some(current) = config.interfaces[intf_index].current.take() else {
                continue;
            };
            if let Some(alt) = config.descriptor.interfaces[intf_index].alt_setting(current) {
                for ep in &alt.endpoints {
                    if let Err(err) = bus.with_controller(|c| c.close_pipe(address, ep.address)) {
                        warn!(
                            "device {}: closing pipe {:02x} failed: {err}",
                            device.id, ep.address
                        );
                    }
                }
            }
        }
        config.is_active = false;
        core::mem::take(&mut config.load)
    }

    /// Realizes an alternate-setting change. The request goes to the device
    /// first; a STALL means only the default setting is implemented and is
    /// tolerated — the hardware diff proceeds regardless so the host's pipe
    /// state matches what such devices expect.
    ///
    /// The diff is by endpoint address: pipes whose attributes are
    /// unchanged between the two settings are not touched, changed ones
    /// are modified in place, departed ones closed, new ones opened.
    pub(crate) async fn set_interface_inner(
        &self,
        bus: &Arc<Bus>,
        device: &Arc<Device>,
        config_index: usize,
        intf_index: usize,
        alt_setting: u8,
        send_request: bool,
    ) -> Result<()> {
        let (address, speed, interface_number, old_endpoints, new_endpoints, old_alt) = {
            let state = device.state.lock();
            let config = state
                .configurations
                .get(config_index)
                .ok_or(UsbError::InvalidArgument)?;
            let interface = config
                .descriptor
                .interfaces
                .get(intf_index)
                .ok_or(UsbError::InvalidArgument)?;
            let new_alt = interface
                .alt_setting(alt_setting)
                .ok_or(UsbError::InvalidArgument)?;
            let old_alt = config.interfaces[intf_index].current;
            let old_endpoints: Vec<EndpointDescriptor> = old_alt
                .and_then(|number| interface.alt_setting(number))
                .map(|alt| alt.endpoints.clone())
                .unwrap_or_default();
            (
                state.address,
                device.speed,
                interface.interface_number,
                old_endpoints,
                new_alt.endpoints.clone(),
                old_alt,
            )
        };

        if send_request {
            let setup = SetupPacket::new(
                Direction::Out,
                RequestType::Standard,
                Recipient::Interface,
                Request::SetInterface,
                alt_setting as u16,
                interface_number as u16,
                0,
            );
            // STALL here means "only the default setting is supported";
            // the transfer's outcome is deliberately ignored.
            let _ = control_no_data(bus, self.kernel(), address, setup).await;
        }

        if old_alt != Some(alt_setting) {
            let mut opened: Vec<u8> = Vec::new();
            for new_ep in &new_endpoints {
                let step = match old_endpoints
                    .iter()
                    .find(|old_ep| old_ep.address == new_ep.address)
                {
                    Some(old_ep) if same_pipe_attributes(old_ep, new_ep) => Ok(()),
                    Some(_) => bus
                        .with_controller(|c| c.modify_pipe(&pipe_config(address, speed, new_ep))),
                    None => bus
                        .with_controller(|c| c.open_pipe(&pipe_config(address, speed, new_ep)))
                        .inspect(|_| opened.push(new_ep.address)),
                };
                if let Err(err) = step {
                    for &ep_address in &opened {
                        let _ = bus.with_controller(|c| c.close_pipe(address, ep_address));
                    }
                    return Err(err);
                }
            }

            for old_ep in &old_endpoints {
                if !new_endpoints.iter().any(|new_ep| new_ep.address == old_ep.address) {
                    bus.with_controller(|c| c.close_pipe(address, old_ep.address))?;
                }
            }
        }

        device.state.lock().configurations[config_index].interfaces[intf_index].current =
            Some(alt_setting);
        Ok(())
    }
}
