//! Control Transfer Engine: synchronous request/response over a default
//! pipe, serialized bus-wide.

use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use log::{debug, trace, warn};

use coral_usb_if::err::TransferError;
use coral_usb_if::host::{ControlRequest, TransferToken};
use coral_usb_if::transfer::{Direction, SetupPacket};

use crate::bus::Bus;
use crate::osal::{Deadline, Kernel};

pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// bEndpointAddress of the default pipe.
pub(crate) const DEFAULT_PIPE_ENDPOINT: u8 = 0x80;

struct WaitCompletion<'a> {
    bus: &'a Bus,
    kernel: &'a dyn Kernel,
    token: TransferToken,
    deadline: Deadline,
}

impl Future for WaitCompletion<'_> {
    /// `None` on timeout.
    type Output = Option<(Vec<u8>, Result<usize, TransferError>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(done) = self.bus.with_controller(|c| c.poll_transfer(self.token)) {
            return Poll::Ready(Some(done));
        }
        if self.deadline.expired(self.kernel) {
            return Poll::Ready(None);
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Submits one control transfer and blocks the calling task until it
/// completes or the 5 s timeout strikes.
///
/// Returns the buffer together with the transferred byte count; 0 means
/// failure. A status-only OUT that succeeds is reported as the setup packet
/// length. On timeout the pipe is flushed before returning.
///
/// The bus-wide serialization token is held for the duration of the call
/// and released exactly once on every path.
pub(crate) async fn control_transfer(
    bus: &Bus,
    kernel: &dyn Kernel,
    address: u8,
    setup: SetupPacket,
    buffer: Vec<u8>,
    read_until_short: bool,
) -> (Vec<u8>, usize) {
    let direction = setup.direction();

    let _serial = bus.ctrl_serial().await;

    trace!(
        "control {:02x}:{:02x} on address {address}, wLength {}",
        setup.request_type, setup.request, setup.length
    );

    let token = match bus.with_controller(|c| {
        c.submit_control(
            address,
            ControlRequest {
                setup,
                buffer,
                read_until_short,
            },
        )
    }) {
        Ok(token) => token,
        Err(err) => {
            warn!("control submit failed on address {address}: {err}");
            return (Vec::new(), 0);
        }
    };

    let wait = WaitCompletion {
        bus,
        kernel,
        token,
        deadline: Deadline::after(kernel, CONTROL_TIMEOUT),
    };
    match wait.await {
        Some((buffer, Ok(len))) => {
            // An OUT transfer with no data phase counts the setup packet.
            let len = if direction == Direction::Out && len == 0 {
                SetupPacket::SIZE
            } else {
                len
            };
            (buffer, len)
        }
        Some((buffer, Err(err))) => {
            debug!("control transfer failed on address {address}: {err}");
            (buffer, 0)
        }
        None => {
            warn!("control transfer timed out on address {address}, flushing pipe");
            let _ = bus.with_controller(|c| c.cancel(address, DEFAULT_PIPE_ENDPOINT));
            (Vec::new(), 0)
        }
    }
}

/// IN transfer sized by the setup packet's wLength.
pub(crate) async fn control_in(
    bus: &Bus,
    kernel: &dyn Kernel,
    address: u8,
    setup: SetupPacket,
    read_until_short: bool,
) -> (Vec<u8>, usize) {
    let buffer = alloc::vec![0u8; setup.length as usize];
    control_transfer(bus, kernel, address, setup, buffer, read_until_short).await
}

/// Status-only transfer; returns the transferred length (0 = failure).
pub(crate) async fn control_no_data(
    bus: &Bus,
    kernel: &dyn Kernel,
    address: u8,
    setup: SetupPacket,
) -> usize {
    control_transfer(bus, kernel, address, setup, Vec::new(), false)
        .await
        .1
}

/// OUT transfer carrying `data`.
pub(crate) async fn control_out(
    bus: &Bus,
    kernel: &dyn Kernel,
    address: u8,
    setup: SetupPacket,
    data: Vec<u8>,
) -> usize {
    control_transfer(bus, kernel, address, setup, data, false)
        .await
        .1
}
