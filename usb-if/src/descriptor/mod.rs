//! Parsed USB descriptor structures and the flat-buffer parser.

use alloc::{string::String, vec::Vec};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::err::UsbError;
use crate::transfer::Direction;

mod bos;
mod class_code;
mod lang_id;

pub use bos::*;
pub use class_code::ClassCode;
pub use lang_id::LanguageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfiguration = 0x07,
    InterfacePower = 0x08,
    Otg = 0x09,
    Debug = 0x0a,
    InterfaceAssociation = 0x0b,
    Bos = 0x0f,
    DeviceCapability = 0x10,
    SsEndpointCompanion = 0x30,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Device descriptor, USB 2.0 table 9-8. String fields keep the raw index,
/// 0 meaning "no string".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_release: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer_string_index: u8,
    pub product_string_index: u8,
    pub serial_number_string_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Length of the fixed prefix fetched to learn `max_packet_size0`.
    pub const PREFIX_LEN: usize = 8;
    pub const LEN: usize = 18;

    /// Parses the 8-byte prefix. Fields past `max_packet_size0` are zero.
    pub fn parse_prefix(raw: &[u8]) -> Result<Self, UsbError> {
        if raw.len() < Self::PREFIX_LEN || raw[1] != u8::from(DescriptorType::Device) {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            usb_release: u16::from_le_bytes([raw[2], raw[3]]),
            class: raw[4],
            subclass: raw[5],
            protocol: raw[6],
            max_packet_size0: raw[7],
            ..Default::default()
        })
    }

    pub fn parse(raw: &[u8]) -> Result<Self, UsbError> {
        if raw.len() < Self::LEN || raw[0] < Self::LEN as u8 {
            return Err(UsbError::InvalidDescriptor);
        }
        let mut desc = Self::parse_prefix(raw)?;
        desc.vendor_id = u16::from_le_bytes([raw[8], raw[9]]);
        desc.product_id = u16::from_le_bytes([raw[10], raw[11]]);
        desc.device_release = u16::from_le_bytes([raw[12], raw[13]]);
        desc.manufacturer_string_index = raw[14];
        desc.product_string_index = raw[15];
        desc.serial_number_string_index = raw[16];
        desc.num_configurations = raw[17];
        Ok(desc)
    }

    pub fn class_code(&self) -> ClassCode {
        ClassCode::of(self.class)
    }

    /// Default-pipe max packet size in bytes. SuperSpeed encodes an exponent.
    pub fn max_packet_size0_bytes(&self) -> u16 {
        if self.max_packet_size0 == 9 {
            512
        } else {
            self.max_packet_size0 as u16
        }
    }
}

bitflags::bitflags! {
    /// Configuration bmAttributes, USB 2.0 table 9-10.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConfigAttributes: u8 {
        const REMOTE_WAKEUP = 1 << 5;
        const SELF_POWERED = 1 << 6;
    }
}

/// One parsed configuration: the ordered interface set, each interface an
/// ordered set of alternate settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: ConfigAttributes,
    /// Current draw in 2 mA units (8 mA units on SuperSpeed).
    pub max_power: u8,
    pub interfaces: Vec<Interface>,
    pub otg: Option<OtgDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub interface_number: u8,
    pub alt_settings: Vec<InterfaceDescriptor>,
}

impl Interface {
    pub fn first_alt_setting(&self) -> &InterfaceDescriptor {
        &self.alt_settings[0]
    }

    pub fn alt_setting(&self, alternate: u8) -> Option<&InterfaceDescriptor> {
        self.alt_settings
            .iter()
            .find(|alt| alt.alternate_setting == alternate)
    }
}

/// One alternate setting of an interface, USB 2.0 table 9-12, with its
/// endpoint descriptors attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn class_code(&self) -> ClassCode {
        ClassCode::of(self.class)
    }
}

/// Endpoint descriptor, USB 2.0 table 9-13.
///
/// `max_packet_size` keeps the raw wMaxPacketSize including the high-speed
/// additional-transaction bits 12:11.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn endpoint_number(&self) -> u8 {
        self.address & 0x0f
    }
}

/// OTG descriptor, OTG supplement table 6-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtgDescriptor {
    pub srp_capable: bool,
    pub hnp_capable: bool,
}

const CONFIG_DESC_LEN: usize = 9;
const INTERFACE_DESC_LEN: usize = 9;
const ENDPOINT_DESC_LEN: usize = 7;

/// Parses a complete configuration hierarchy out of the raw buffer returned
/// by GET_DESCRIPTOR(configuration): the configuration header followed by
/// interface, endpoint and class-specific descriptors in wire order.
/// Class-specific descriptors are skipped; an endpoint before any interface
/// is a malformed reply from the device.
pub fn parse_configuration(raw: &[u8]) -> Result<ConfigurationDescriptor, UsbError> {
    if raw.len() < CONFIG_DESC_LEN
        || raw[0] < CONFIG_DESC_LEN as u8
        || raw[1] != u8::from(DescriptorType::Configuration)
    {
        return Err(UsbError::InvalidDescriptor);
    }

    let total_length = u16::from_le_bytes([raw[2], raw[3]]);
    let mut config = ConfigurationDescriptor {
        total_length,
        configuration_value: raw[5],
        string_index: raw[6],
        attributes: ConfigAttributes::from_bits_truncate(raw[7]),
        max_power: raw[8],
        interfaces: Vec::new(),
        otg: None,
    };

    let mut offset = raw[0] as usize;
    while offset + 2 <= raw.len() {
        let len = raw[offset] as usize;
        if len < 2 || offset + len > raw.len() {
            return Err(UsbError::InvalidDescriptor);
        }
        let kind = raw[offset + 1];

        if kind == u8::from(DescriptorType::Interface) {
            if len < INTERFACE_DESC_LEN {
                return Err(UsbError::InvalidDescriptor);
            }
            let alt = InterfaceDescriptor {
                interface_number: raw[offset + 2],
                alternate_setting: raw[offset + 3],
                num_endpoints: raw[offset + 4],
                class: raw[offset + 5],
                subclass: raw[offset + 6],
                protocol: raw[offset + 7],
                string_index: raw[offset + 8],
                endpoints: Vec::new(),
            };
            match config
                .interfaces
                .iter_mut()
                .find(|intf| intf.interface_number == alt.interface_number)
            {
                Some(intf) => intf.alt_settings.push(alt),
                None => config.interfaces.push(Interface {
                    interface_number: alt.interface_number,
                    alt_settings: alloc::vec![alt],
                }),
            }
        } else if kind == u8::from(DescriptorType::Endpoint) {
            if len < ENDPOINT_DESC_LEN {
                return Err(UsbError::InvalidDescriptor);
            }
            let ep = EndpointDescriptor {
                address: raw[offset + 2],
                transfer_type: EndpointType::try_from(raw[offset + 3] & 0x03)
                    .map_err(|_| UsbError::InvalidDescriptor)?,
                max_packet_size: u16::from_le_bytes([raw[offset + 4], raw[offset + 5]]),
                interval: raw[offset + 6],
            };
            let alt = config
                .interfaces
                .last_mut()
                .and_then(|intf| intf.alt_settings.last_mut())
                .ok_or(UsbError::InvalidDescriptor)?;
            alt.endpoints.push(ep);
        } else if kind == u8::from(DescriptorType::Otg) && len >= 3 {
            config.otg = Some(OtgDescriptor {
                srp_capable: raw[offset + 2] & 0x01 != 0,
                hnp_capable: raw[offset + 2] & 0x02 != 0,
            });
        }
        // Class and vendor specific descriptors ride along untouched.

        offset += len;
    }

    if config.interfaces.is_empty() {
        log::warn!(
            "configuration {} has no interfaces",
            config.configuration_value
        );
    }

    Ok(config)
}

/// Decodes a string descriptor's UTF-16LE payload.
pub fn decode_string_descriptor(raw: &[u8]) -> Result<String, UsbError> {
    if raw.len() < 2 || raw[1] != u8::from(DescriptorType::String) {
        return Err(UsbError::InvalidDescriptor);
    }
    let len = raw[0] as usize;
    if len < 2 || len > raw.len() || len % 2 != 0 {
        return Err(UsbError::InvalidDescriptor);
    }
    let units: Vec<u16> = raw[2..len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(char::decode_utf16(units.into_iter())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

/// Extracts the language ids from string descriptor index 0.
pub fn parse_language_table(raw: &[u8]) -> Result<Vec<LanguageId>, UsbError> {
    if raw.len() < 2 || raw[1] != u8::from(DescriptorType::String) {
        return Err(UsbError::InvalidDescriptor);
    }
    let len = (raw[0] as usize).min(raw.len());
    if len < 2 {
        return Err(UsbError::InvalidDescriptor);
    }
    Ok(raw[2..len]
        .chunks_exact(2)
        .map(|pair| LanguageId(u16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}
