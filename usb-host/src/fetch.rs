//! Descriptor Fetch Sequencer: the two-phase "probe the length, then fetch
//! the whole descriptor" protocol, shared by device, configuration and BOS
//! reads.

use alloc::{string::String, vec::Vec};

use log::debug;

use coral_usb_if::descriptor::{
    BosDescriptor, ConfigurationDescriptor, DescriptorType, DeviceDescriptor, LanguageId,
    decode_string_descriptor, parse_bos, parse_bos_total_length, parse_configuration,
    parse_language_table,
};
use coral_usb_if::err::{Result, UsbError};
use coral_usb_if::transfer::{Direction, Recipient, Request, RequestType, SetupPacket};

use crate::bus::Bus;
use crate::control::control_in;
use crate::osal::Kernel;

const CONFIG_PREFIX_LEN: usize = 8;
const STRING_PREFIX_LEN: usize = 4;

const VALID_USB_RELEASES: [u16; 6] = [0x0100, 0x0101, 0x0110, 0x0200, 0x0210, 0x0300];

/// Sanity checks on the 8-byte device-descriptor prefix. A peer reporting
/// values outside these sets is not something the stack can talk to.
pub(crate) fn validate_device_prefix(descriptor: &DeviceDescriptor) -> Result<()> {
    if !VALID_USB_RELEASES.contains(&descriptor.usb_release) {
        return Err(UsbError::InvalidDescriptor);
    }
    match descriptor.max_packet_size0 {
        8 | 16 | 32 | 64 => Ok(()),
        // SuperSpeed encodes the exponent.
        9 if descriptor.usb_release >= 0x0300 => Ok(()),
        _ => Err(UsbError::InvalidDescriptor),
    }
}

/// Descriptor reads against one device's default pipe.
pub(crate) struct Fetcher<'a> {
    pub bus: &'a Bus,
    pub kernel: &'a dyn Kernel,
    pub address: u8,
    /// Max packet size of the default pipe, for short-packet framing.
    pub max_packet_size0: u16,
}

fn get_descriptor(ty: DescriptorType, index: u8, language: u16, length: u16) -> SetupPacket {
    SetupPacket::new(
        Direction::In,
        RequestType::Standard,
        Recipient::Device,
        Request::GetDescriptor,
        ((u8::from(ty) as u16) << 8) | index as u16,
        language,
        length,
    )
}

impl Fetcher<'_> {
    /// A transfer whose length is wire-aligned only completes on a short or
    /// zero-length packet; the framing hint tells the controller so.
    fn read_until_short(&self, total: usize) -> bool {
        total % self.max_packet_size0 as usize == 0
    }

    async fn fetch(&self, setup: SetupPacket, read_until_short: bool) -> (Vec<u8>, usize) {
        control_in(self.bus, self.kernel, self.address, setup, read_until_short).await
    }

    /// First 8 bytes of the device descriptor, enough to learn
    /// bMaxPacketSize0.
    pub async fn device_prefix(&self) -> Result<DeviceDescriptor> {
        let setup = get_descriptor(
            DescriptorType::Device,
            0,
            0,
            DeviceDescriptor::PREFIX_LEN as u16,
        );
        let (raw, len) = self.fetch(setup, false).await;
        if len < DeviceDescriptor::PREFIX_LEN {
            return Err(UsbError::InvalidDescriptor);
        }
        let descriptor = DeviceDescriptor::parse_prefix(&raw)?;
        validate_device_prefix(&descriptor)?;
        Ok(descriptor)
    }

    /// The complete 18-byte device descriptor.
    pub async fn device_full(&self) -> Result<DeviceDescriptor> {
        let setup = get_descriptor(DescriptorType::Device, 0, 0, DeviceDescriptor::LEN as u16);
        let (raw, len) = self.fetch(setup, false).await;
        if len < DeviceDescriptor::LEN {
            return Err(UsbError::InvalidDescriptor);
        }
        DeviceDescriptor::parse(&raw)
    }

    /// One configuration descriptor with its whole interface/endpoint tree,
    /// plus the raw buffer it was parsed from.
    pub async fn configuration(&self, index: u8) -> Result<(ConfigurationDescriptor, Vec<u8>)> {
        let setup = get_descriptor(
            DescriptorType::Configuration,
            index,
            0,
            CONFIG_PREFIX_LEN as u16,
        );
        let (raw, len) = self.fetch(setup, false).await;
        if len < CONFIG_PREFIX_LEN {
            return Err(UsbError::InvalidDescriptor);
        }
        let total = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        if total < CONFIG_PREFIX_LEN {
            return Err(UsbError::InvalidDescriptor);
        }

        let setup = get_descriptor(DescriptorType::Configuration, index, 0, total as u16);
        let (raw, len) = self.fetch(setup, self.read_until_short(total)).await;
        if len < total {
            return Err(UsbError::InvalidDescriptor);
        }
        let config = parse_configuration(&raw[..total])?;
        debug!(
            "configuration {index}: value {}, {} interfaces, {total} bytes",
            config.configuration_value,
            config.interfaces.len()
        );
        Ok((config, raw))
    }

    /// The BOS descriptor hierarchy (SuperSpeed only), 5-byte prefix first.
    pub async fn bos(&self) -> Result<(BosDescriptor, Vec<u8>)> {
        let setup = get_descriptor(DescriptorType::Bos, 0, 0, BosDescriptor::PREFIX_LEN as u16);
        let (raw, len) = self.fetch(setup, false).await;
        if len < BosDescriptor::PREFIX_LEN {
            return Err(UsbError::InvalidDescriptor);
        }
        let total = parse_bos_total_length(&raw)? as usize;
        if total < BosDescriptor::PREFIX_LEN {
            return Err(UsbError::InvalidDescriptor);
        }

        let setup = get_descriptor(DescriptorType::Bos, 0, 0, total as u16);
        let (raw, len) = self.fetch(setup, self.read_until_short(total)).await;
        if len < total {
            return Err(UsbError::InvalidDescriptor);
        }
        let bos = parse_bos(&raw[..total])?;
        Ok((bos, raw))
    }

    /// The language-id table, string descriptor index 0. Fetched once and
    /// cached by the caller before any other string is requested.
    pub async fn language_table(&self) -> Result<Vec<LanguageId>> {
        let raw = self.string_raw(0, 0).await?;
        parse_language_table(&raw)
    }

    /// One string descriptor in one language, decoded from UTF-16LE.
    pub async fn string(&self, index: u8, language: LanguageId) -> Result<String> {
        let raw = self.string_raw(index, language.into()).await?;
        decode_string_descriptor(&raw)
    }

    async fn string_raw(&self, index: u8, language: u16) -> Result<Vec<u8>> {
        let setup = get_descriptor(
            DescriptorType::String,
            index,
            language,
            STRING_PREFIX_LEN as u16,
        );
        let (raw, len) = self.fetch(setup, false).await;
        if len < 2 {
            return Err(UsbError::InvalidDescriptor);
        }
        let total = raw[0] as usize;
        if total < 2 {
            return Err(UsbError::InvalidDescriptor);
        }

        let setup = get_descriptor(DescriptorType::String, index, language, total as u16);
        let (raw, len) = self.fetch(setup, self.read_until_short(total)).await;
        if len < total {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(raw)
    }
}
