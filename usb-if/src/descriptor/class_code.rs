/// USB class codes as assigned by the USB-IF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassCode {
    /// Class defined at the interface level.
    UseInterface,
    Audio,
    Comm,
    Hid,
    Physical,
    Image,
    Printer,
    MassStorage,
    Hub,
    CdcData,
    SmartCard,
    ContentSecurity,
    Video,
    PersonalHealthcare,
    AudioVideo,
    Billboard,
    TypeCBridge,
    Diagnostic,
    WirelessController,
    Miscellaneous,
    ApplicationSpecific,
    VendorSpecific,
    Unknown(u8),
}

impl ClassCode {
    pub fn of(value: u8) -> Self {
        match value {
            0x00 => Self::UseInterface,
            0x01 => Self::Audio,
            0x02 => Self::Comm,
            0x03 => Self::Hid,
            0x05 => Self::Physical,
            0x06 => Self::Image,
            0x07 => Self::Printer,
            0x08 => Self::MassStorage,
            0x09 => Self::Hub,
            0x0a => Self::CdcData,
            0x0b => Self::SmartCard,
            0x0d => Self::ContentSecurity,
            0x0e => Self::Video,
            0x0f => Self::PersonalHealthcare,
            0x10 => Self::AudioVideo,
            0x11 => Self::Billboard,
            0x12 => Self::TypeCBridge,
            0xdc => Self::Diagnostic,
            0xe0 => Self::WirelessController,
            0xef => Self::Miscellaneous,
            0xfe => Self::ApplicationSpecific,
            0xff => Self::VendorSpecific,
            other => Self::Unknown(other),
        }
    }
}
