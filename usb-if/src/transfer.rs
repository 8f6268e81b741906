//! Standard control request vocabulary, USB 2.0/3.0 chapter 9.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

/// bmRequestType bits 6:5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// bmRequestType bits 4:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard request codes, USB 2.0 table 9-4 and USB 3.0 table 9-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0a,
    SetInterface = 0x0b,
    SynchFrame = 0x0c,
    SetSel = 0x30,
    SetIsochDelay = 0x31,
}

/// Standard feature selectors, USB 2.0 table 9-6 and USB 3.0 table 9-7.
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    /// Interface recipient, USB 3.0 only.
    pub const FUNCTION_SUSPEND: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
    pub const TEST_MODE: u16 = 2;
    pub const B_HNP_ENABLE: u16 = 3;
    pub const A_HNP_SUPPORT: u16 = 4;
    pub const U1_ENABLE: u16 = 48;
    pub const U2_ENABLE: u16 = 49;
    pub const LTM_ENABLE: u16 = 50;
}

/// The 8-byte setup packet opening every control transfer.
///
/// Field encoding is bit-exact per USB 2.0 table 9-2; `to_bytes` produces
/// the little-endian wire form handed to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn new(
        direction: Direction,
        ty: RequestType,
        recipient: Recipient,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let dir_bit = match direction {
            Direction::Out => 0,
            Direction::In => 0x80,
        };
        Self {
            request_type: dir_bit | (u8::from(ty) << 5) | u8::from(recipient),
            request: request.into(),
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}
