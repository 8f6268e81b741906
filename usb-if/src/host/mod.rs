//! The host-controller abstraction the stack drives.
//!
//! The trait deliberately ends at pipes and transfers: link training,
//! signaling and scheduling live below it, descriptor and resource policy
//! above it.

use alloc::vec::Vec;

use crate::DrMode;
use crate::descriptor::EndpointType;
use crate::err::{TransferError, UsbError};
use crate::transfer::SetupPacket;

/// Negotiated device or controller speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceSpeed {
    Low = 0,
    Full = 1,
    High = 2,
    Wireless = 3,
    SuperSpeed = 4,
    SuperSpeedPlus = 5,
}

/// Everything the controller needs to realize one pipe in hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeConfig {
    pub device_address: u8,
    pub endpoint_address: u8,
    pub transfer_type: EndpointType,
    pub speed: DeviceSpeed,
    /// Effective max packet size in bytes (multiplier applied).
    pub max_packet_size: u16,
    /// Service interval in µs; 0 for non-periodic pipes.
    pub interval_us: u32,
    /// Scheduled bus time in µs per frame/microframe.
    pub load: u32,
}

/// One control transfer handed to the controller. The buffer is the OUT
/// payload or the IN landing area; it is returned by `poll_transfer` when
/// the transfer completes.
#[derive(Debug)]
pub struct ControlRequest {
    pub setup: SetupPacket,
    pub buffer: Vec<u8>,
    /// IN framing hint: the expected length is wire-aligned, so completion
    /// is delimited by a short or zero-length packet rather than the byte
    /// count alone.
    pub read_until_short: bool,
}

/// Token naming an in-flight transfer until `poll_transfer` yields it back.
pub type TransferToken = u64;

/// Host-controller hardware operations.
///
/// All calls are non-blocking; transfer completion is observed by polling.
/// The stack serializes control traffic itself and never issues two
/// outstanding control transfers on one bus.
pub trait Controller: Send + 'static {
    /// Brings the controller to the operational state.
    fn init(&mut self) -> Result<(), UsbError>;

    /// Speed of the root port(s), fixing the bus bandwidth budget.
    fn speed(&self) -> DeviceSpeed;

    fn open_pipe(&mut self, pipe: &PipeConfig) -> Result<(), UsbError>;

    /// Re-parameterizes an already-open pipe in place.
    fn modify_pipe(&mut self, pipe: &PipeConfig) -> Result<(), UsbError>;

    fn close_pipe(&mut self, device_address: u8, endpoint_address: u8) -> Result<(), UsbError>;

    /// Queues a control transfer on the default pipe of `device_address`.
    fn submit_control(
        &mut self,
        device_address: u8,
        request: ControlRequest,
    ) -> Result<TransferToken, UsbError>;

    /// Completion poll. `None` while in flight; on completion the buffer is
    /// handed back together with the actual transferred length.
    fn poll_transfer(
        &mut self,
        token: TransferToken,
    ) -> Option<(Vec<u8>, Result<usize, TransferError>)>;

    /// Cancels whatever is in flight on the pipe (flush).
    fn cancel(&mut self, device_address: u8, endpoint_address: u8) -> Result<(), UsbError>;

    /// Updates the default pipe's max packet size once the real value is
    /// known from the device-descriptor prefix.
    fn update_max_packet_size(&mut self, device_address: u8, size: u16) -> Result<(), UsbError>;

    /// Invoked when the last device besides the root hub has left the bus.
    fn request_power_down(&mut self);

    /// Whether the configuration's current draw can be supplied.
    fn current_available(&mut self, _device_address: u8, _max_power: u8) -> bool {
        true
    }

    /// Releases the current reservation of an unconfigured device.
    fn release_power(&mut self, _device_address: u8) {}

    /// OTG role of the given root port, where supported.
    fn get_role(&mut self, _port: u8) -> Result<DrMode, UsbError> {
        Err(UsbError::Unavailable)
    }
}
