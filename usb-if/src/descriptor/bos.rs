//! Binary Device Object Store parsing, USB 3.0 §9.6.2.

use alloc::vec::Vec;

use super::DescriptorType;
use crate::err::UsbError;

bitflags::bitflags! {
    /// wSpeedsSupported of the SuperSpeed capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpeedsSupported: u16 {
        const LOW = 1 << 0;
        const FULL = 1 << 1;
        const HIGH = 1 << 2;
        const GEN1 = 1 << 3;
    }
}

/// SuperSpeed USB device capability, USB 3.0 table 9-12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperSpeedCapability {
    pub ltm_capable: bool,
    pub speeds_supported: SpeedsSupported,
    /// Lowest speed at which all functionality is available, encoded as the
    /// bit index of `speeds_supported`.
    pub functionality_support: u8,
    /// U1 exit latency in µs.
    pub u1_exit_latency: u8,
    /// U2 exit latency in µs.
    pub u2_exit_latency: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCapability {
    Usb2Extension { lpm_capable: bool },
    SuperSpeed(SuperSpeedCapability),
    Other { kind: u8 },
}

const CAP_TYPE_USB2_EXTENSION: u8 = 0x02;
const CAP_TYPE_SUPERSPEED: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BosDescriptor {
    pub total_length: u16,
    pub capabilities: Vec<DeviceCapability>,
}

impl BosDescriptor {
    /// Length of the prefix fetched to learn wTotalLength.
    pub const PREFIX_LEN: usize = 5;

    pub fn superspeed(&self) -> Option<&SuperSpeedCapability> {
        self.capabilities.iter().find_map(|cap| match cap {
            DeviceCapability::SuperSpeed(ss) => Some(ss),
            _ => None,
        })
    }
}

/// Reads wTotalLength out of the 5-byte BOS prefix.
pub fn parse_bos_total_length(raw: &[u8]) -> Result<u16, UsbError> {
    if raw.len() < BosDescriptor::PREFIX_LEN || raw[1] != u8::from(DescriptorType::Bos) {
        return Err(UsbError::InvalidDescriptor);
    }
    Ok(u16::from_le_bytes([raw[2], raw[3]]))
}

pub fn parse_bos(raw: &[u8]) -> Result<BosDescriptor, UsbError> {
    let total_length = parse_bos_total_length(raw)?;
    if raw.len() < total_length as usize {
        return Err(UsbError::InvalidDescriptor);
    }

    let mut capabilities = Vec::with_capacity(raw[4] as usize);
    let mut offset = raw[0] as usize;
    while offset + 3 <= total_length as usize {
        let len = raw[offset] as usize;
        if len < 3
            || offset + len > raw.len()
            || raw[offset + 1] != u8::from(DescriptorType::DeviceCapability)
        {
            return Err(UsbError::InvalidDescriptor);
        }
        let cap = match raw[offset + 2] {
            CAP_TYPE_USB2_EXTENSION if len >= 7 => DeviceCapability::Usb2Extension {
                lpm_capable: raw[offset + 3] & 0x02 != 0,
            },
            CAP_TYPE_SUPERSPEED if len >= 10 => {
                DeviceCapability::SuperSpeed(SuperSpeedCapability {
                    ltm_capable: raw[offset + 3] & 0x02 != 0,
                    speeds_supported: SpeedsSupported::from_bits_truncate(u16::from_le_bytes([
                        raw[offset + 4],
                        raw[offset + 5],
                    ])),
                    functionality_support: raw[offset + 6],
                    u1_exit_latency: raw[offset + 7],
                    u2_exit_latency: u16::from_le_bytes([raw[offset + 8], raw[offset + 9]]),
                })
            }
            kind => DeviceCapability::Other { kind },
        };
        capabilities.push(cap);
        offset += len;
    }

    Ok(BosDescriptor {
        total_length,
        capabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bos_with_superspeed_capability() {
        let raw = [
            5, 0x0f, 22, 0, 2, // BOS header, two capabilities
            7, 0x10, 0x02, 0x02, 0, 0, 0, // USB 2.0 extension, LPM
            10, 0x10, 0x03, 0x00, 0x0e, 0x00, 2, 10, 0xff, 0x07, // SuperSpeed
        ];
        assert_eq!(parse_bos_total_length(&raw[..5]).unwrap(), 22);

        let bos = parse_bos(&raw).unwrap();
        assert_eq!(bos.capabilities.len(), 2);
        let ss = bos.superspeed().unwrap();
        assert!(!ss.ltm_capable);
        assert!(ss.speeds_supported.contains(SpeedsSupported::GEN1));
        assert_eq!(ss.functionality_support, 2);
        assert_eq!(ss.u2_exit_latency, 0x07ff);
    }

    #[test]
    fn test_parse_bos_rejects_short_buffer() {
        let raw = [5, 0x0f, 40, 0, 1];
        assert_eq!(parse_bos(&raw), Err(UsbError::InvalidDescriptor));
    }
}
