//! Descriptor upload parser and validator
//!
//! The upload is untrusted. `parse_descriptors` either returns a complete
//! [`DescriptorTable`] or an error; nothing is retained on failure.

use crate::descriptor::{Descriptor, ENDPOINT_NUMBER_MASK};
use crate::error::{ProtocolError, Result};
use crate::os_desc::{ExtPropTotals, OsDescGroup, parse_os_groups};
use crate::types::SpeedVariant;
use crate::wire::{DescriptorFlags, MAX_ENDPOINTS, MIN_UPLOAD_LEN, UploadFormat};
use bytes::Buf;
use serde::Serialize;
use tracing::debug;

/// Logical endpoint slot (1-based) to the address declared in descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EndpointMap([u8; MAX_ENDPOINTS + 1]);

impl EndpointMap {
    /// Declared address of `slot`, if assigned
    pub fn address(&self, slot: usize) -> Option<u8> {
        match self.0.get(slot) {
            Some(&addr) if slot > 0 && addr != 0 => Some(addr),
            _ => None,
        }
    }

    /// Slot declaring `address`
    pub fn slot_of(&self, address: u8) -> Option<usize> {
        (1..self.0.len()).find(|&slot| self.0[slot] == address)
    }

    fn set(&mut self, slot: usize, address: u8) {
        self.0[slot] = address;
    }
}

/// Validated descriptor upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorTable {
    pub format: UploadFormat,
    pub flags: DescriptorFlags,
    /// Present when `EVENTFD` is flagged
    pub notify_handle: Option<u32>,
    /// Records per speed variant, indexed by [`SpeedVariant::index`]
    pub speeds: [Vec<Descriptor>; 3],
    pub os_groups: Vec<OsDescGroup>,
    pub interfaces_count: usize,
    pub eps_count: usize,
    /// Highest string index referenced
    pub strings_count: usize,
    pub eps_addrmap: EndpointMap,
    pub ext_props: ExtPropTotals,
}

impl DescriptorTable {
    pub fn variant(&self, speed: SpeedVariant) -> &[Descriptor] {
        &self.speeds[speed.index()]
    }

    /// Speed variants that carry at least one record
    pub fn present_speeds(&self) -> impl Iterator<Item = SpeedVariant> + '_ {
        SpeedVariant::ALL
            .into_iter()
            .filter(|speed| !self.speeds[speed.index()].is_empty())
    }

    pub fn virtual_addressing(&self) -> bool {
        self.flags.contains(DescriptorFlags::VIRTUAL_ADDR)
    }
}

/// Per-variant accounting
#[derive(Default)]
struct VariantTally {
    interfaces: usize,
    eps: usize,
}

struct Walk {
    addrmap: EndpointMap,
    strings: usize,
    /// Counts of the first parsed variant
    reference: Option<(usize, usize)>,
}

impl Walk {
    fn account(&mut self, desc: &Descriptor, tally: &mut VariantTally) -> Result<()> {
        match desc {
            Descriptor::Interface(intf) => {
                tally.interfaces = tally.interfaces.max(usize::from(intf.interface_number) + 1);
                self.note_string(intf.string_index);
            }
            Descriptor::InterfaceAssociation(iad) => {
                tally.interfaces = tally.interfaces.max(usize::from(iad.first_interface) + 1);
                self.note_string(iad.string_index);
            }
            Descriptor::Endpoint(ep) => {
                if ep.address & ENDPOINT_NUMBER_MASK == 0 {
                    return Err(ProtocolError::InvalidEndpointAddress(ep.address));
                }
                tally.eps += 1;
                if tally.eps > MAX_ENDPOINTS {
                    return Err(ProtocolError::TooManyEndpoints { max: MAX_ENDPOINTS });
                }
                let slot = tally.eps;
                if self.reference.is_none() {
                    self.addrmap.set(slot, ep.address);
                } else if self.addrmap.address(slot) != Some(ep.address) {
                    return Err(ProtocolError::EndpointAddressMismatch {
                        slot,
                        expected: self.addrmap.address(slot).unwrap_or(0),
                        found: ep.address,
                    });
                }
            }
            Descriptor::Hid(_) | Descriptor::Otg(_) | Descriptor::SsEndpointCompanion(_) => {}
        }
        Ok(())
    }

    fn note_string(&mut self, index: u8) {
        if index != 0 {
            self.strings = self.strings.max(usize::from(index));
        }
    }
}

fn take_u32(data: &mut &[u8], what: &'static str) -> Result<u32> {
    if data.len() < 4 {
        return Err(ProtocolError::truncated(what, 4, data.len()));
    }
    Ok(data.get_u32_le())
}

/// Parse and validate a descriptor upload.
pub fn parse_descriptors(upload: &[u8]) -> Result<DescriptorTable> {
    if upload.len() < MIN_UPLOAD_LEN {
        return Err(ProtocolError::truncated(
            "descriptor header",
            MIN_UPLOAD_LEN,
            upload.len(),
        ));
    }
    let mut data = upload;
    let magic = data.get_u32_le();
    let declared = data.get_u32_le() as usize;
    if declared != upload.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: upload.len(),
        });
    }

    let format = UploadFormat::from_magic(magic).ok_or(ProtocolError::BadMagic(magic))?;
    let flags = match format {
        UploadFormat::Legacy => DescriptorFlags::HAS_FS | DescriptorFlags::HAS_HS,
        UploadFormat::V2 => {
            let bits = data.get_u32_le();
            DescriptorFlags::from_bits(bits).ok_or(ProtocolError::UnsupportedFlags(bits))?
        }
    };

    let notify_handle = if flags.contains(DescriptorFlags::EVENTFD) {
        Some(take_u32(&mut data, "notification handle")?)
    } else {
        None
    };

    let mut counts = [0u32; 3];
    for speed in SpeedVariant::ALL {
        if flags.contains(speed.flag()) {
            counts[speed.index()] = take_u32(&mut data, "descriptor count")?;
        }
    }
    let os_count = if flags.contains(DescriptorFlags::HAS_MS_OS) {
        take_u32(&mut data, "OS descriptor count")?
    } else {
        0
    };

    let records_start = data.len();
    let mut walk = Walk {
        addrmap: EndpointMap::default(),
        strings: 0,
        reference: None,
    };
    let mut speeds: [Vec<Descriptor>; 3] = Default::default();

    for speed in SpeedVariant::ALL {
        let count = counts[speed.index()];
        if count == 0 {
            continue;
        }
        let mut tally = VariantTally::default();
        let mut records = Vec::new();
        for _ in 0..count {
            let (desc, used) = Descriptor::decode(data)?;
            walk.account(&desc, &mut tally)?;
            data.advance(used);
            records.push(desc);
        }

        match walk.reference {
            None => walk.reference = Some((tally.eps, tally.interfaces)),
            Some((eps, interfaces)) if eps != tally.eps || interfaces != tally.interfaces => {
                return Err(ProtocolError::SpeedVariantMismatch {
                    speed: speed.name(),
                    eps: tally.eps,
                    interfaces: tally.interfaces,
                    expected_eps: eps,
                    expected_interfaces: interfaces,
                });
            }
            Some(_) => {}
        }
        debug!(
            "{}-speed variant: {} records, {} endpoints, {} interfaces",
            speed.name(),
            records.len(),
            tally.eps,
            tally.interfaces
        );
        speeds[speed.index()] = records;
    }

    let (eps_count, interfaces_count) = walk.reference.unwrap_or((0, 0));

    let mut ext_props = ExtPropTotals::default();
    let os_groups = if os_count > 0 {
        parse_os_groups(&mut data, os_count, interfaces_count, &mut ext_props)?
    } else {
        Vec::new()
    };

    if data.len() == records_start {
        return Err(ProtocolError::NoDescriptors);
    }
    if !data.is_empty() {
        return Err(ProtocolError::TrailingBytes(data.len()));
    }

    Ok(DescriptorTable {
        format,
        flags,
        notify_handle,
        speeds,
        os_groups,
        interfaces_count,
        eps_count,
        strings_count: walk.strings,
        eps_addrmap: walk.addrmap,
        ext_props,
    })
}
