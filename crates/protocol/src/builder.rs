//! Upload encoders
//!
//! Used by tooling that prepares uploads and by tests.
//!
//! ```
//! use protocol::{DescriptorUpload, SpeedVariant, parse_descriptors};
//! use protocol::descriptor::{Descriptor, InterfaceDescriptor};
//!
//! let intf = Descriptor::Interface(InterfaceDescriptor {
//!     interface_number: 0,
//!     alternate_setting: 0,
//!     num_endpoints: 0,
//!     class: 0xff,
//!     subclass: 0,
//!     protocol: 0,
//!     string_index: 0,
//! });
//! let upload = DescriptorUpload::v2().speed(SpeedVariant::Full, vec![intf]).encode();
//! let table = parse_descriptors(&upload).unwrap();
//! assert_eq!(table.interfaces_count, 1);
//! ```

use crate::descriptor::Descriptor;
use crate::os_desc::OsDescGroup;
use crate::parser::DescriptorTable;
use crate::types::SpeedVariant;
use crate::wire::{DescriptorFlags, UploadFormat};
use bytes::BufMut;

/// Builder for a descriptor upload
#[derive(Debug, Clone)]
pub struct DescriptorUpload {
    format: UploadFormat,
    flags: DescriptorFlags,
    notify_handle: Option<u32>,
    speeds: [Vec<Descriptor>; 3],
    os_groups: Vec<OsDescGroup>,
}

impl DescriptorUpload {
    /// Legacy layout: full and high speed blocks are always present
    pub fn legacy() -> Self {
        Self {
            format: UploadFormat::Legacy,
            flags: DescriptorFlags::HAS_FS | DescriptorFlags::HAS_HS,
            notify_handle: None,
            speeds: Default::default(),
            os_groups: Vec::new(),
        }
    }

    pub fn v2() -> Self {
        Self {
            format: UploadFormat::V2,
            flags: DescriptorFlags::NONE,
            ..Self::legacy()
        }
    }

    /// Rebuild an upload from a parsed table
    pub fn from_table(table: &DescriptorTable) -> Self {
        Self {
            format: table.format,
            flags: table.flags,
            notify_handle: table.notify_handle,
            speeds: table.speeds.clone(),
            os_groups: table.os_groups.clone(),
        }
    }

    pub fn speed(mut self, speed: SpeedVariant, records: Vec<Descriptor>) -> Self {
        self.flags.insert(speed.flag());
        self.speeds[speed.index()] = records;
        self
    }

    pub fn os_group(mut self, group: OsDescGroup) -> Self {
        self.flags.insert(DescriptorFlags::HAS_MS_OS);
        self.os_groups.push(group);
        self
    }

    pub fn virtual_addressing(mut self) -> Self {
        self.flags.insert(DescriptorFlags::VIRTUAL_ADDR);
        self
    }

    pub fn notify_handle(mut self, handle: u32) -> Self {
        self.flags.insert(DescriptorFlags::EVENTFD);
        self.notify_handle = Some(handle);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32_le(self.format.magic());
        // length is patched once known
        out.put_u32_le(0);
        if self.format == UploadFormat::V2 {
            out.put_u32_le(self.flags.bits());
        }
        if let Some(handle) = self.notify_handle.filter(|_| self.flags.contains(DescriptorFlags::EVENTFD)) {
            out.put_u32_le(handle);
        }
        for speed in SpeedVariant::ALL {
            if self.flags.contains(speed.flag()) {
                out.put_u32_le(self.speeds[speed.index()].len() as u32);
            }
        }
        if self.flags.contains(DescriptorFlags::HAS_MS_OS) {
            out.put_u32_le(self.os_groups.len() as u32);
        }
        for speed in SpeedVariant::ALL {
            if self.flags.contains(speed.flag()) {
                for desc in &self.speeds[speed.index()] {
                    desc.encode(&mut out);
                }
            }
        }
        for group in &self.os_groups {
            group.encode(&mut out);
        }
        let total = out.len() as u32;
        out[4..8].copy_from_slice(&total.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_descriptors;
    use crate::wire::DESCRIPTORS_MAGIC;

    #[test]
    fn test_legacy_header_layout() {
        let upload = DescriptorUpload::legacy().encode();
        // magic, length, fs_count, hs_count
        assert_eq!(upload.len(), 16);
        assert_eq!(&upload[0..4], &DESCRIPTORS_MAGIC.to_le_bytes());
        assert_eq!(&upload[4..8], &16u32.to_le_bytes());
    }

    #[test]
    fn test_from_table_reencodes_identically() {
        let intf = Descriptor::decode(&[9, 4, 0, 0, 0, 0xff, 0, 0, 0]).unwrap().0;
        let upload = DescriptorUpload::v2()
            .virtual_addressing()
            .speed(SpeedVariant::High, vec![intf])
            .encode();
        let table = parse_descriptors(&upload).unwrap();
        assert_eq!(DescriptorUpload::from_table(&table).encode(), upload);
    }
}
