//! Test utilities for ffs-gadget
//!
//! Provides upload fixtures and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::FunctionFixture;
//! use protocol::parse_descriptors;
//!
//! let fixture = FunctionFixture::bulk_loopback();
//! let table = parse_descriptors(&fixture.descriptors()).unwrap();
//! assert_eq!(table.eps_count, 2);
//! ```

use protocol::descriptor::{Descriptor, EndpointDescriptor, InterfaceDescriptor, SsEndpointCompanion};
use protocol::os_desc::{ExtCompat, ExtProp, ExtPropType, OsDescGroup, OsFeatures};
use protocol::{DescriptorUpload, SetupPacket, SpeedVariant, StringTable, UsbString, encode_strings};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint declared by a fixture
#[derive(Debug, Clone, Copy)]
pub struct FixtureEndpoint {
    pub address: u8,
    /// bmAttributes transfer type bits
    pub attributes: u8,
}

impl FixtureEndpoint {
    pub fn bulk(address: u8) -> Self {
        Self {
            address,
            attributes: 0x02,
        }
    }

    pub fn interrupt(address: u8) -> Self {
        Self {
            address,
            attributes: 0x03,
        }
    }

    pub fn isochronous(address: u8) -> Self {
        Self {
            address,
            attributes: 0x01,
        }
    }
}

/// Describes a whole function and produces its descriptor and string uploads
#[derive(Debug, Clone)]
pub struct FunctionFixture {
    pub interfaces: u8,
    /// Endpoints are spread round-robin over the interfaces
    pub endpoints: Vec<FixtureEndpoint>,
    pub speeds: Vec<SpeedVariant>,
    pub languages: Vec<u16>,
    pub virtual_addressing: bool,
    pub os_descriptors: bool,
    pub notify_handle: Option<u32>,
}

impl FunctionFixture {
    /// One vendor interface with a bulk IN (0x81) and bulk OUT (0x02) pair,
    /// full and high speed, one US English string.
    pub fn bulk_loopback() -> Self {
        Self {
            interfaces: 1,
            endpoints: vec![FixtureEndpoint::bulk(0x81), FixtureEndpoint::bulk(0x02)],
            speeds: vec![SpeedVariant::Full, SpeedVariant::High],
            languages: vec![0x0409],
            virtual_addressing: false,
            os_descriptors: false,
            notify_handle: None,
        }
    }

    pub fn with_interfaces(mut self, interfaces: u8) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<FixtureEndpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_speeds(mut self, speeds: &[SpeedVariant]) -> Self {
        self.speeds = speeds.to_vec();
        self
    }

    pub fn with_languages(mut self, languages: &[u16]) -> Self {
        self.languages = languages.to_vec();
        self
    }

    pub fn with_virtual_addressing(mut self) -> Self {
        self.virtual_addressing = true;
        self
    }

    /// Adds a WINUSB compat group for interface 0 and a GUID property
    pub fn with_os_descriptors(mut self) -> Self {
        self.os_descriptors = true;
        self
    }

    pub fn with_notify_handle(mut self, handle: u32) -> Self {
        self.notify_handle = Some(handle);
        self
    }

    /// Packet size used for `speed`
    pub fn max_packet(speed: SpeedVariant) -> u16 {
        match speed {
            SpeedVariant::Full => 64,
            SpeedVariant::High => 512,
            SpeedVariant::Super => 1024,
        }
    }

    /// Descriptor records for one speed variant
    pub fn records(&self, speed: SpeedVariant) -> Vec<Descriptor> {
        let interfaces = self.interfaces.max(1);
        let mut records = Vec::new();
        for n in 0..interfaces {
            let eps: Vec<&FixtureEndpoint> = self
                .endpoints
                .iter()
                .enumerate()
                .filter(|(i, _)| *i % usize::from(interfaces) == usize::from(n))
                .map(|(_, ep)| ep)
                .collect();
            records.push(Descriptor::Interface(InterfaceDescriptor {
                interface_number: n,
                alternate_setting: 0,
                num_endpoints: eps.len() as u8,
                class: 0xff,
                subclass: 0,
                protocol: 0,
                string_index: n + 1,
            }));
            for ep in eps {
                let max_packet_size = match (ep.attributes & 0x03, speed) {
                    (0x03, _) => 16,
                    (_, speed) => Self::max_packet(speed),
                };
                records.push(Descriptor::Endpoint(EndpointDescriptor {
                    address: ep.address,
                    attributes: ep.attributes,
                    max_packet_size,
                    interval: if ep.attributes & 0x03 == 0x02 { 0 } else { 1 },
                    audio: None,
                }));
                if speed == SpeedVariant::Super {
                    records.push(Descriptor::SsEndpointCompanion(SsEndpointCompanion {
                        max_burst: 0,
                        attributes: 0,
                        bytes_per_interval: 0,
                    }));
                }
            }
        }
        records
    }

    /// Encoded descriptor upload
    pub fn descriptors(&self) -> Vec<u8> {
        let mut upload = DescriptorUpload::v2();
        for &speed in &self.speeds {
            upload = upload.speed(speed, self.records(speed));
        }
        if self.virtual_addressing {
            upload = upload.virtual_addressing();
        }
        if let Some(handle) = self.notify_handle {
            upload = upload.notify_handle(handle);
        }
        if self.os_descriptors {
            upload = upload
                .os_group(OsDescGroup {
                    interface: 0,
                    features: OsFeatures::ExtCompat(vec![ExtCompat {
                        first_interface: 0,
                        compatible_id: *b"WINUSB\0\0",
                        sub_compatible_id: [0; 8],
                    }]),
                })
                .os_group(OsDescGroup {
                    interface: 0,
                    features: OsFeatures::ExtProp(vec![ExtProp {
                        data_type: ExtPropType::Unicode,
                        name: b"Label\0".to_vec(),
                        data: b"loopback\0".to_vec(),
                    }]),
                });
        }
        upload.encode()
    }

    /// Text of string index `index` (1-based) in `language`
    pub fn string_text(language: u16, index: usize) -> String {
        format!("intf{}-{:04x}", index, language)
    }

    /// Encoded string upload covering every referenced index
    pub fn strings(&self) -> Vec<u8> {
        let count = usize::from(self.interfaces.max(1));
        let tables: Vec<StringTable> = self
            .languages
            .iter()
            .map(|&language| StringTable {
                language,
                strings: (1..=count)
                    .map(|index| UsbString {
                        id: 0,
                        text: Self::string_text(language, index),
                    })
                    .collect(),
            })
            .collect();
        encode_strings(&tables)
    }
}

/// Build a setup packet for tests
///
/// # Arguments
/// * `request_type` - bmRequestType
/// * `request` - bRequest
/// * `value` - wValue
/// * `index` - wIndex
/// * `length` - wLength
pub fn create_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
}

/// Vendor IN request to interface `index` asking for `length` bytes
pub fn vendor_in(index: u16, length: u16) -> SetupPacket {
    create_setup_packet(0xc1, 0x01, 0, index, length)
}

/// Vendor OUT request to interface `index` carrying `length` bytes
pub fn vendor_out(index: u16, length: u16) -> SetupPacket {
    create_setup_packet(0x41, 0x02, 0, index, length)
}

/// Deterministic payload of `size` bytes
pub fn create_test_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{parse_descriptors, parse_strings};

    #[test]
    fn test_bulk_loopback_fixture_parses() {
        let fixture = FunctionFixture::bulk_loopback();
        let table = parse_descriptors(&fixture.descriptors()).unwrap();
        assert_eq!(table.interfaces_count, 1);
        assert_eq!(table.eps_addrmap.address(1), Some(0x81));
        assert_eq!(table.eps_addrmap.address(2), Some(0x02));

        let tables = parse_strings(&fixture.strings(), table.strings_count).unwrap();
        assert_eq!(tables[0].strings[0].text, "intf1-0409");
    }

    #[test]
    fn test_os_fixture_parses() {
        let fixture = FunctionFixture::bulk_loopback()
            .with_speeds(&[SpeedVariant::Full, SpeedVariant::High, SpeedVariant::Super])
            .with_os_descriptors();
        let table = parse_descriptors(&fixture.descriptors()).unwrap();
        assert_eq!(table.os_groups.len(), 2);
        assert_eq!(table.ext_props.count, 1);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;
        assert!(result.is_err());
    }
}
