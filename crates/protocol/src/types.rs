//! Link speeds, descriptor speed variants and endpoint attributes

use crate::wire::DescriptorFlags;
use serde::{Deserialize, Serialize};

/// Negotiated USB link speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UsbSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl UsbSpeed {
    /// Descriptor variant a function presents at this link speed
    pub fn variant(self) -> SpeedVariant {
        match self {
            UsbSpeed::Low | UsbSpeed::Full => SpeedVariant::Full,
            UsbSpeed::High => SpeedVariant::High,
            UsbSpeed::Super | UsbSpeed::SuperPlus => SpeedVariant::Super,
        }
    }
}

/// One of the three descriptor sets a function may supply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SpeedVariant {
    Full = 0,
    High = 1,
    Super = 2,
}

impl SpeedVariant {
    /// Wire order of the per-speed blocks
    pub const ALL: [SpeedVariant; 3] = [SpeedVariant::Full, SpeedVariant::High, SpeedVariant::Super];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> DescriptorFlags {
        match self {
            SpeedVariant::Full => DescriptorFlags::HAS_FS,
            SpeedVariant::High => DescriptorFlags::HAS_HS,
            SpeedVariant::Super => DescriptorFlags::HAS_SS,
        }
    }

    /// Lowest link speed at which this variant is used
    pub fn min_speed(self) -> UsbSpeed {
        match self {
            SpeedVariant::Full => UsbSpeed::Full,
            SpeedVariant::High => UsbSpeed::High,
            SpeedVariant::Super => UsbSpeed::Super,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpeedVariant::Full => "full",
            SpeedVariant::High => "high",
            SpeedVariant::Super => "super",
        }
    }
}

/// Data direction relative to the host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction bit of an endpoint address or bmRequestType
    pub fn from_bit7(byte: u8) -> Self {
        if byte & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}
