//! Microsoft OS descriptor feature groups
//!
//! A group starts with an 11-byte header naming the interface it belongs to
//! and whether it carries extended-compatibility or extended-property records.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut};
use serde::Serialize;

pub const OS_DESC_HEADER_SIZE: usize = 11;
pub const EXT_COMPAT_SIZE: usize = 24;
/// dwSize + dwPropertyDataType + wPropertyNameLength
pub const EXT_PROP_HEADER_SIZE: usize = 10;
/// Fixed part of an extended property: header plus dwPropertyDataLength
pub const EXT_PROP_FIXED_SIZE: usize = 14;

const OS_DESC_VERSION: u16 = 1;
const INDEX_EXT_COMPAT: u16 = 4;
const INDEX_EXT_PROP: u16 = 5;

/// dwPropertyDataType vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtPropType {
    Unicode = 1,
    UnicodeEnv = 2,
    Binary = 3,
    Le32 = 4,
    Be32 = 5,
    UnicodeLink = 6,
    UnicodeMulti = 7,
}

impl ExtPropType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => ExtPropType::Unicode,
            2 => ExtPropType::UnicodeEnv,
            3 => ExtPropType::Binary,
            4 => ExtPropType::Le32,
            5 => ExtPropType::Be32,
            6 => ExtPropType::UnicodeLink,
            7 => ExtPropType::UnicodeMulti,
            _ => return None,
        })
    }

    /// Types whose data is reported to the host as UTF-16 units
    pub fn is_unicode(self) -> bool {
        matches!(
            self,
            ExtPropType::Unicode
                | ExtPropType::UnicodeEnv
                | ExtPropType::UnicodeLink
                | ExtPropType::UnicodeMulti
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtCompat {
    pub first_interface: u8,
    pub compatible_id: [u8; 8],
    pub sub_compatible_id: [u8; 8],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtProp {
    pub data_type: ExtPropType,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

impl ExtProp {
    /// dwSize of the encoded record
    pub fn size(&self) -> usize {
        EXT_PROP_FIXED_SIZE + self.name.len() + self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "records", rename_all = "snake_case")]
pub enum OsFeatures {
    ExtCompat(Vec<ExtCompat>),
    ExtProp(Vec<ExtProp>),
}

/// One feature group with its interface back-reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsDescGroup {
    pub interface: u8,
    pub features: OsFeatures,
}

/// Aggregate sizes of all extended properties, used to size bind-time storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtPropTotals {
    pub count: usize,
    pub name_bytes: usize,
    pub data_bytes: usize,
}

/// Parse `count` feature groups from the front of `data`, advancing it.
pub fn parse_os_groups(
    data: &mut &[u8],
    count: u32,
    interfaces_count: usize,
    totals: &mut ExtPropTotals,
) -> Result<Vec<OsDescGroup>> {
    let mut groups = Vec::new();
    for _ in 0..count {
        groups.push(parse_group(data, interfaces_count, totals)?);
    }
    Ok(groups)
}

fn parse_group(
    data: &mut &[u8],
    interfaces_count: usize,
    totals: &mut ExtPropTotals,
) -> Result<OsDescGroup> {
    if data.len() < OS_DESC_HEADER_SIZE {
        return Err(ProtocolError::truncated(
            "OS descriptor header",
            OS_DESC_HEADER_SIZE,
            data.len(),
        ));
    }
    let interface = data.get_u8();
    let dw_length = data.get_u32_le() as usize;
    let version = data.get_u16_le();
    let index = data.get_u16_le();
    let count = data.get_u16_le();

    // dwLength covers the header itself
    if dw_length > data.len() + OS_DESC_HEADER_SIZE {
        return Err(ProtocolError::InvalidOsDescriptor("dwLength exceeds upload"));
    }
    if version != OS_DESC_VERSION {
        return Err(ProtocolError::OsDescriptorVersion(version));
    }

    let features = match index {
        INDEX_EXT_COMPAT => {
            // bCount followed by a reserved byte that must be zero
            if count > 0xff {
                return Err(ProtocolError::InvalidOsDescriptor(
                    "extended compat reserved byte set",
                ));
            }
            let mut records =
                Vec::with_capacity(usize::from(count).min(data.len() / EXT_COMPAT_SIZE));
            for _ in 0..count {
                records.push(parse_ext_compat(data, interfaces_count)?);
            }
            OsFeatures::ExtCompat(records)
        }
        INDEX_EXT_PROP => {
            if usize::from(interface) >= interfaces_count {
                return Err(ProtocolError::OsInterfaceOutOfRange {
                    interface,
                    count: interfaces_count,
                });
            }
            let mut records =
                Vec::with_capacity(usize::from(count).min(data.len() / EXT_PROP_FIXED_SIZE));
            for _ in 0..count {
                let prop = parse_ext_prop(data)?;
                totals.count += 1;
                totals.name_bytes += prop.name.len();
                totals.data_bytes += prop.data.len();
                records.push(prop);
            }
            OsFeatures::ExtProp(records)
        }
        other => return Err(ProtocolError::OsDescriptorIndex(other)),
    };

    Ok(OsDescGroup {
        interface,
        features,
    })
}

fn parse_ext_compat(data: &mut &[u8], interfaces_count: usize) -> Result<ExtCompat> {
    if data.len() < EXT_COMPAT_SIZE {
        return Err(ProtocolError::truncated(
            "extended compat record",
            EXT_COMPAT_SIZE,
            data.len(),
        ));
    }
    let first_interface = data.get_u8();
    let reserved1 = data.get_u8();
    let mut compatible_id = [0u8; 8];
    data.copy_to_slice(&mut compatible_id);
    let mut sub_compatible_id = [0u8; 8];
    data.copy_to_slice(&mut sub_compatible_id);
    let mut reserved2 = [0u8; 6];
    data.copy_to_slice(&mut reserved2);

    if usize::from(first_interface) >= interfaces_count {
        return Err(ProtocolError::OsInterfaceOutOfRange {
            interface: first_interface,
            count: interfaces_count,
        });
    }
    if reserved1 != 1 {
        return Err(ProtocolError::InvalidOsDescriptor(
            "extended compat Reserved1 must be 1",
        ));
    }
    if reserved2.iter().any(|&b| b != 0) {
        return Err(ProtocolError::InvalidOsDescriptor(
            "extended compat Reserved2 must be zero",
        ));
    }

    Ok(ExtCompat {
        first_interface,
        compatible_id,
        sub_compatible_id,
    })
}

fn parse_ext_prop(data: &mut &[u8]) -> Result<ExtProp> {
    if data.len() < EXT_PROP_HEADER_SIZE {
        return Err(ProtocolError::truncated(
            "extended property header",
            EXT_PROP_HEADER_SIZE,
            data.len(),
        ));
    }
    let mut head = &data[..EXT_PROP_HEADER_SIZE];
    let size = head.get_u32_le();
    let raw_type = head.get_u32_le();
    let name_len = usize::from(head.get_u16_le());

    if size as usize > data.len() {
        return Err(ProtocolError::truncated(
            "extended property",
            size as usize,
            data.len(),
        ));
    }
    let data_type = ExtPropType::from_u32(raw_type).ok_or(ProtocolError::ExtPropType(raw_type))?;
    let fixed = EXT_PROP_FIXED_SIZE + name_len;
    if (size as usize) < fixed {
        return Err(ProtocolError::ExtPropSize {
            declared: size,
            computed: fixed as u64,
        });
    }
    let mut rest = &data[EXT_PROP_HEADER_SIZE + name_len..];
    let data_len = rest.get_u32_le();
    let computed = fixed as u64 + u64::from(data_len);
    if u64::from(size) != computed {
        return Err(ProtocolError::ExtPropSize {
            declared: size,
            computed,
        });
    }

    let record = &data[..size as usize];
    let name = record[EXT_PROP_HEADER_SIZE..EXT_PROP_HEADER_SIZE + name_len].to_vec();
    let value = record[fixed..].to_vec();
    data.advance(size as usize);

    Ok(ExtProp {
        data_type,
        name,
        data: value,
    })
}

impl OsDescGroup {
    /// Encoded size including the header
    pub fn encoded_len(&self) -> usize {
        OS_DESC_HEADER_SIZE
            + match &self.features {
                OsFeatures::ExtCompat(records) => records.len() * EXT_COMPAT_SIZE,
                OsFeatures::ExtProp(records) => records.iter().map(ExtProp::size).sum(),
            }
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.interface);
        out.put_u32_le(self.encoded_len() as u32);
        out.put_u16_le(OS_DESC_VERSION);
        match &self.features {
            OsFeatures::ExtCompat(records) => {
                out.put_u16_le(INDEX_EXT_COMPAT);
                out.put_u8(records.len() as u8);
                out.put_u8(0);
                for rec in records {
                    out.put_u8(rec.first_interface);
                    out.put_u8(1);
                    out.put_slice(&rec.compatible_id);
                    out.put_slice(&rec.sub_compatible_id);
                    out.put_slice(&[0u8; 6]);
                }
            }
            OsFeatures::ExtProp(records) => {
                out.put_u16_le(INDEX_EXT_PROP);
                out.put_u16_le(records.len() as u16);
                for rec in records {
                    out.put_u32_le(rec.size() as u32);
                    out.put_u32_le(rec.data_type as u32);
                    out.put_u16_le(rec.name.len() as u16);
                    out.put_slice(&rec.name);
                    out.put_u32_le(rec.data.len() as u32);
                    out.put_slice(&rec.data);
                }
            }
        }
    }
}
