//! Upload validation errors

use thiserror::Error;

/// Rejection reasons for descriptor and string uploads
///
/// Every variant means the whole upload was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer ended before a field or record was complete
    #[error("Truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Unknown magic 0x{0:08x}")]
    BadMagic(u32),

    /// Header length echo does not match the buffer
    #[error("Length mismatch: header says {declared}, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unsupported flag bits 0x{0:08x}")]
    UnsupportedFlags(u32),

    #[error("Upload carries no descriptors")]
    NoDescriptors,

    #[error("{0} trailing bytes after last record")]
    TrailingBytes(usize),

    #[error("Descriptor length {0} is shorter than its header")]
    ShortDescriptor(u8),

    /// Kind belongs to the enclosing device or configuration
    #[error("Descriptor type 0x{0:02x} is reserved for the device")]
    ReservedDescriptor(u8),

    #[error("Descriptor type 0x{0:02x} is not supported")]
    UnsupportedDescriptor(u8),

    #[error("Descriptor type 0x{kind:02x} has invalid length {length}")]
    BadDescriptorLength { kind: u8, length: u8 },

    #[error("Endpoint address 0x{0:02x} has no endpoint number")]
    InvalidEndpointAddress(u8),

    #[error("More than {max} endpoints declared")]
    TooManyEndpoints { max: usize },

    /// A speed variant declares a different address for a logical slot
    #[error("Endpoint slot {slot}: address 0x{found:02x} differs from 0x{expected:02x}")]
    EndpointAddressMismatch { slot: usize, expected: u8, found: u8 },

    /// A speed variant declares different endpoint/interface counts
    #[error("{speed}-speed variant declares {eps} endpoints and {interfaces} interfaces, expected {expected_eps} and {expected_interfaces}")]
    SpeedVariantMismatch {
        speed: &'static str,
        eps: usize,
        interfaces: usize,
        expected_eps: usize,
        expected_interfaces: usize,
    },

    #[error("Unsupported OS descriptor version {0}")]
    OsDescriptorVersion(u16),

    #[error("Unsupported OS descriptor index {0}")]
    OsDescriptorIndex(u16),

    #[error("Invalid OS descriptor: {0}")]
    InvalidOsDescriptor(&'static str),

    #[error("OS descriptor references interface {interface}, only {count} declared")]
    OsInterfaceOutOfRange { interface: u8, count: usize },

    #[error("Unsupported extended property type {0}")]
    ExtPropType(u32),

    #[error("Extended property size {declared} does not match contents {computed}")]
    ExtPropSize { declared: u32, computed: u64 },

    /// String and language counts must both be zero or both non-zero
    #[error("String count {strings} inconsistent with language count {languages}")]
    InconsistentStringCounts { strings: u32, languages: u32 },

    #[error("Upload supplies {supplied} strings, descriptors reference {needed}")]
    NotEnoughStrings { supplied: u32, needed: usize },

    #[error("String {index} of language 0x{language:04x} is not NUL-terminated")]
    UnterminatedString { language: u16, index: usize },

    #[error("String {index} of language 0x{language:04x} is not valid UTF-8")]
    InvalidString { language: u16, index: usize },

    #[error("Unknown event type {0}")]
    UnknownEvent(u8),
}

impl ProtocolError {
    pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        ProtocolError::Truncated {
            what,
            needed,
            available,
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::EndpointAddressMismatch {
            slot: 2,
            expected: 0x81,
            found: 0x82,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("slot 2"));
        assert!(msg.contains("0x82"));
        assert!(msg.contains("0x81"));
    }

    #[test]
    fn test_truncated_display() {
        let err = ProtocolError::truncated("header", 16, 4);
        assert_eq!(
            err.to_string(),
            "Truncated header: needed 16 bytes, 4 available"
        );
    }
}
