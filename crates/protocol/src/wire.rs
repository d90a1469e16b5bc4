//! Magic numbers, flag bits and fixed sizes of the upload formats
//!
//! All multi-byte fields on the wire are little-endian.

use serde::Serialize;
use std::fmt;
use std::ops::BitOr;

/// Descriptor upload, legacy layout (implies full + high speed, no flags word)
pub const DESCRIPTORS_MAGIC: u32 = 1;
/// String table upload
pub const STRINGS_MAGIC: u32 = 2;
/// Descriptor upload with a flags word
pub const DESCRIPTORS_MAGIC_V2: u32 = 3;

/// Shortest write accepted while collecting descriptors or strings
pub const MIN_UPLOAD_LEN: usize = 16;

/// Size of one control event record returned by a control-channel read
pub const EVENT_SIZE: usize = 12;

/// Maximum number of endpoint records a single speed variant may declare
pub const MAX_ENDPOINTS: usize = 15;

/// Size of a setup packet
pub const SETUP_PACKET_SIZE: usize = 8;

/// Header variant selected by the descriptor upload magic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadFormat {
    /// Magic 1: fixed full/high-speed layout
    Legacy,
    /// Magic 3: flags word selects the blocks present
    V2,
}

impl UploadFormat {
    pub fn magic(self) -> u32 {
        match self {
            UploadFormat::Legacy => DESCRIPTORS_MAGIC,
            UploadFormat::V2 => DESCRIPTORS_MAGIC_V2,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            DESCRIPTORS_MAGIC => Some(UploadFormat::Legacy),
            DESCRIPTORS_MAGIC_V2 => Some(UploadFormat::V2),
            _ => None,
        }
    }
}

/// Flags word of a v2 descriptor upload
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct DescriptorFlags(u32);

impl DescriptorFlags {
    pub const NONE: Self = Self(0);
    pub const HAS_FS: Self = Self(0x01);
    pub const HAS_HS: Self = Self(0x02);
    pub const HAS_SS: Self = Self(0x04);
    pub const HAS_MS_OS: Self = Self(0x08);
    /// Keep user-declared endpoint addresses instead of the physical ones
    pub const VIRTUAL_ADDR: Self = Self(0x10);
    /// A notification handle follows the flags word
    pub const EVENTFD: Self = Self(0x20);

    const KNOWN: u32 = 0x3f;

    /// Returns `None` when any bit outside the known set is present.
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::KNOWN == 0).then_some(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for DescriptorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for DescriptorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(DescriptorFlags, &str); 6] = [
            (DescriptorFlags::HAS_FS, "HAS_FS"),
            (DescriptorFlags::HAS_HS, "HAS_HS"),
            (DescriptorFlags::HAS_SS, "HAS_SS"),
            (DescriptorFlags::HAS_MS_OS, "HAS_MS_OS"),
            (DescriptorFlags::VIRTUAL_ADDR, "VIRTUAL_ADDR"),
            (DescriptorFlags::EVENTFD, "EVENTFD"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "DescriptorFlags({})", names.join(" | "))
    }
}
