//! Wire formats for the FunctionFS-style function control plane
//!
//! This crate decodes and validates what a userspace function driver writes
//! to its control channel: the descriptor upload (per-speed descriptor
//! records plus Microsoft OS descriptor groups) and the string table upload.
//! It also defines the setup packet and the fixed-size control event record
//! returned by control-channel reads.
//!
//! # Example
//!
//! ```
//! use protocol::{DescriptorUpload, SpeedVariant, parse_descriptors, parse_strings};
//! use protocol::descriptor::{Descriptor, EndpointDescriptor, InterfaceDescriptor};
//! use protocol::strings::{StringTable, UsbString, encode_strings};
//!
//! let records = vec![
//!     Descriptor::Interface(InterfaceDescriptor {
//!         interface_number: 0,
//!         alternate_setting: 0,
//!         num_endpoints: 1,
//!         class: 0xff,
//!         subclass: 0,
//!         protocol: 0,
//!         string_index: 1,
//!     }),
//!     Descriptor::Endpoint(EndpointDescriptor {
//!         address: 0x81,
//!         attributes: 0x02,
//!         max_packet_size: 64,
//!         interval: 0,
//!         audio: None,
//!     }),
//! ];
//! let upload = DescriptorUpload::v2().speed(SpeedVariant::Full, records).encode();
//! let table = parse_descriptors(&upload).unwrap();
//! assert_eq!(table.eps_count, 1);
//!
//! let strings = encode_strings(&[StringTable {
//!     language: 0x0409,
//!     strings: vec![UsbString { id: 0, text: "Loopback".into() }],
//! }]);
//! let tables = parse_strings(&strings, table.strings_count).unwrap();
//! assert_eq!(tables[0].strings[0].text, "Loopback");
//! ```

pub mod builder;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod os_desc;
pub mod parser;
pub mod strings;
pub mod types;
pub mod wire;

pub use builder::DescriptorUpload;
pub use descriptor::{Descriptor, EndpointDescriptor};
pub use error::{ProtocolError, Result};
pub use event::{ControlEvent, EventType, Recipient, SetupPacket};
pub use os_desc::{ExtCompat, ExtProp, ExtPropTotals, ExtPropType, OsDescGroup, OsFeatures};
pub use parser::{DescriptorTable, EndpointMap, parse_descriptors};
pub use strings::{StringTable, UsbString, encode_strings, parse_strings};
pub use types::{Direction, SpeedVariant, TransferType, UsbSpeed};
pub use wire::{DescriptorFlags, EVENT_SIZE, MAX_ENDPOINTS, MIN_UPLOAD_LEN, UploadFormat};
