//! Per-endpoint bus-time cost and admission accounting, USB 2.0 §5.11.3.

use coral_usb_if::descriptor::{ConfigurationDescriptor, EndpointDescriptor, EndpointType};
use coral_usb_if::host::DeviceSpeed;
use coral_usb_if::transfer::Direction;

/// µs of periodic budget per 1 ms frame on a full/low-speed bus (90 %
/// ceiling).
pub const USB1_BANDWIDTH: u32 = 900;
/// µs of periodic budget per 125 µs microframe on a high-speed bus (80 %
/// ceiling).
pub const USB2_BANDWIDTH: u32 = 100;

/// Fixed per-transaction host-controller overhead, ns.
const HOST_DELAY_NS: u32 = 1_000;
/// Hub setup overhead for low-speed transactions through a TT, ns.
const HUB_LS_SETUP_NS: u32 = 333;

/// Transfer type and direction of a pipe, the granularity the bit-time
/// formulas distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Control,
    BulkIn,
    BulkOut,
    InterruptIn,
    InterruptOut,
    IsochronousIn,
    IsochronousOut,
}

impl PipeKind {
    pub fn of(descriptor: &EndpointDescriptor) -> Self {
        match (descriptor.transfer_type, descriptor.direction()) {
            (EndpointType::Control, _) => Self::Control,
            (EndpointType::Bulk, Direction::In) => Self::BulkIn,
            (EndpointType::Bulk, Direction::Out) => Self::BulkOut,
            (EndpointType::Interrupt, Direction::In) => Self::InterruptIn,
            (EndpointType::Interrupt, Direction::Out) => Self::InterruptOut,
            (EndpointType::Isochronous, Direction::In) => Self::IsochronousIn,
            (EndpointType::Isochronous, Direction::Out) => Self::IsochronousOut,
        }
    }

    fn is_isochronous(&self) -> bool {
        matches!(self, Self::IsochronousIn | Self::IsochronousOut)
    }

    fn is_in(&self) -> bool {
        matches!(
            self,
            Self::BulkIn | Self::InterruptIn | Self::IsochronousIn
        )
    }
}

/// Bytes moved per service interval: wMaxPacketSize bits 10:0 scaled by the
/// high-bandwidth additional-transaction bits 12:11.
pub fn effective_packet_size(w_max_packet_size: u16) -> u16 {
    (1 + ((w_max_packet_size >> 11) & 0x03)) * (w_max_packet_size & 0x3ff)
}

/// Worst-case bus time one transaction of the pipe consumes, in µs.
///
/// Closed forms from USB 2.0 §5.11.3, evaluated in ns and rounded to µs at
/// the end. The 3167 term is the bit-stuffing-inflated byte cost, the
/// leading constants the per-speed protocol overhead.
pub fn calc_load(kind: PipeKind, speed: DeviceSpeed, max_packet_size: u16) -> u32 {
    let bytes = max_packet_size as u32;
    // (7 * 8 * bytes / 6) * 1000 + 3167, scaled back to ns.
    let payload = (3_167 + ((7 * 8 * bytes) / 6) * 1_000) / 1_000;

    match speed {
        DeviceSpeed::High => {
            let sync = if kind.is_isochronous() {
                (38 * 8 * 2_083) / 1_000
            } else {
                (55 * 8 * 2_083) / 1_000
            };
            let data = (2_083 * payload) / 1_000;
            (sync + data + HOST_DELAY_NS + 500) / 1_000
        }
        DeviceSpeed::Full => {
            let data = (8_354 * payload) / 100;
            let frame = if !kind.is_isochronous() {
                9_107
            } else if kind.is_in() {
                7_268
            } else {
                6_265
            };
            (frame + data + HOST_DELAY_NS + 500) / 1_000
        }
        DeviceSpeed::Low => {
            if kind.is_in() {
                let data = (67_667 * payload) / 100;
                (64_060 + 2 * HUB_LS_SETUP_NS + data + HOST_DELAY_NS + 500) / 1_000
            } else {
                let data = 667 * payload;
                (64_107 + 2 * HUB_LS_SETUP_NS + data + HOST_DELAY_NS + 500) / 1_000
            }
        }
        // SuperSpeed admission is performed by the controller's own
        // scheduler; the frame-budget model does not apply.
        _ => 0,
    }
}

/// Load of one endpoint at the device's speed.
pub fn endpoint_load(speed: DeviceSpeed, descriptor: &EndpointDescriptor) -> u32 {
    calc_load(
        PipeKind::of(descriptor),
        speed,
        effective_packet_size(descriptor.max_packet_size),
    )
}

/// Bandwidth requirement of a configuration: the sum over every endpoint in
/// every interface's first (default) alternate setting.
pub(crate) fn configuration_load(speed: DeviceSpeed, config: &ConfigurationDescriptor) -> u32 {
    config
        .interfaces
        .iter()
        .filter_map(|intf| intf.alt_settings.first())
        .flat_map(|alt| alt.endpoints.iter())
        .map(|ep| endpoint_load(speed, ep))
        .sum()
}

/// Translates bInterval into a service interval in µs, per endpoint type
/// and speed (USB 2.0 table 9-13 footnotes).
pub fn interval_to_microseconds(
    interval: u8,
    transfer_type: EndpointType,
    speed: DeviceSpeed,
) -> u32 {
    let units: u32 = match transfer_type {
        // Maximum NAK rate for control/bulk; 0 means "never NAKs".
        EndpointType::Control | EndpointType::Bulk => interval as u32,
        EndpointType::Isochronous => {
            if (1..=16).contains(&interval) {
                1 << (interval - 1)
            } else {
                0
            }
        }
        EndpointType::Interrupt => {
            if speed == DeviceSpeed::High {
                if (1..=16).contains(&interval) {
                    1 << (interval - 1)
                } else {
                    0
                }
            } else {
                interval as u32
            }
        }
    };

    // Frames or 125 µs microframes depending on speed.
    if speed == DeviceSpeed::High {
        units * 125
    } else {
        units * 1_000
    }
}
