/// A string-descriptor language id (USB LANGID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LanguageId(pub u16);

impl LanguageId {
    pub const ENGLISH_US: Self = Self(0x0409);
    pub const ENGLISH_UK: Self = Self(0x0809);
    pub const GERMAN: Self = Self(0x0407);
    pub const FRENCH: Self = Self(0x040c);
    pub const JAPANESE: Self = Self(0x0411);
    pub const CHINESE_SIMPLIFIED: Self = Self(0x0804);
}

impl Default for LanguageId {
    fn default() -> Self {
        Self::ENGLISH_US
    }
}

impl From<u16> for LanguageId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<LanguageId> for u16 {
    fn from(value: LanguageId) -> Self {
        value.0
    }
}
