#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub use coral_usb_if::descriptor::*;
pub use coral_usb_if::err::*;
pub use coral_usb_if::host::*;
pub use coral_usb_if::transfer;
pub use coral_usb_if::DrMode;

#[macro_use]
mod _macros;

pub mod bandwidth;
mod bus;
mod config;
mod control;
mod device;
mod driver;
mod enumerate;
mod fetch;
pub mod osal;
mod stack;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{DEFAULT_ADDRESS, MAX_ADDRESSES, ROOT_HUB_ADDRESS};
pub use driver::{ClassDriver, MatchFilter, MatchFlags};
pub use osal::Kernel;
pub use stack::{StatusReport, StatusSink, UsbHostStack};

pub use futures::future::BoxFuture;

define_int_type!(BusId, u64);
define_int_type!(DeviceId, u64);
