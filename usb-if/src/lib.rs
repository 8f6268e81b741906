#![no_std]

extern crate alloc;

pub mod descriptor;
pub mod err;
pub mod host;
pub mod transfer;

/// Dual-role mode a controller port can operate in, as reported by the
/// hardware for OTG-capable ports.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrMode {
    #[default]
    Host,
    Peripheral,
    Otg,
}

pub use host::DeviceSpeed;
