//! Bind-time rewrite of the uploaded descriptor template
//!
//! The template uses logical numbers: interfaces count from 0, endpoints
//! use the addresses the function declared, strings use upload indices.
//! Binding claims hardware endpoints and configuration-wide interface and
//! string ids, then rewrites every speed variant the controller supports.
//!
//! Two passes over the records:
//! 1. Endpoint records claim (or reuse) the hardware endpoint of their slot
//!    and take its address.
//! 2. Interface and association records take their interface ids and
//!    string ids.

use crate::error::{FfsError, Result};
use crate::hw::{Controller, HwEndpoint, RequestId};
use crate::sync::{Transfer, lock};
use protocol::descriptor::{Descriptor, ENDPOINT_NUMBER_MASK, encode_all};
use protocol::{
    DescriptorTable, EndpointDescriptor, EndpointMap, ExtPropType, OsFeatures, SpeedVariant,
    StringTable, UsbSpeed,
};
use serde::Serialize;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

/// Read request still owned by the hardware
#[derive(Clone)]
pub(crate) struct InFlight {
    pub(crate) transfer: Arc<Transfer>,
    pub(crate) id: RequestId,
}

/// Hardware endpoint backing one logical slot
pub(crate) struct LiveEndpoint {
    pub(crate) hw: Arc<dyn HwEndpoint>,
    /// Rewritten descriptor per speed variant
    pub(crate) descs: [Option<EndpointDescriptor>; 3],
    /// Address claimed at autoconfig
    pub(crate) num: u8,
    pub(crate) inflight: Mutex<Option<InFlight>>,
}

impl LiveEndpoint {
    /// Descriptor for `speed`, falling back to slower variants
    pub(crate) fn descriptor_for(&self, speed: UsbSpeed) -> Option<&EndpointDescriptor> {
        let top = speed.variant().index();
        (0..=top).rev().find_map(|idx| self.descs[idx].as_ref())
    }

    /// Descriptor for exactly `speed`
    pub(crate) fn exact_descriptor(&self, speed: UsbSpeed) -> Option<&EndpointDescriptor> {
        self.descs[speed.variant().index()].as_ref()
    }

    pub(crate) fn clear_inflight(&self, transfer: &Arc<Transfer>) {
        let mut inflight = lock(&self.inflight);
        if inflight
            .as_ref()
            .is_some_and(|f| Arc::ptr_eq(&f.transfer, transfer))
        {
            *inflight = None;
        }
    }
}

/// One extended property as presented to the host
///
/// `name_len` and `data_len` are the sizes reported to the host. Names are
/// reported as UTF-16 and so is unicode-family data, which doubles them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundExtProp {
    pub data_type: ExtPropType,
    pub name_len: usize,
    pub data_len: usize,
    /// Range in [`OsDescriptors::names`]
    pub name: Range<usize>,
    /// Range in [`OsDescriptors::data`]
    pub data: Range<usize>,
}

/// OS descriptor table of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsDescTable {
    /// Configuration interface id, 0xff if never mapped
    pub interface_id: u8,
    pub compatible_id: [u8; 8],
    pub sub_compatible_id: [u8; 8],
    pub ext_prop_count: usize,
    /// Reported length of all property records
    pub ext_prop_len: usize,
    pub ext_props: Vec<BoundExtProp>,
}

/// Per-interface OS tables plus the name and data slabs they point into
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsDescriptors {
    pub tables: Vec<OsDescTable>,
    pub names: Vec<u8>,
    pub data: Vec<u8>,
}

impl OsDescriptors {
    pub fn prop_name(&self, prop: &BoundExtProp) -> &[u8] {
        &self.names[prop.name.clone()]
    }

    pub fn prop_data(&self, prop: &BoundExtProp) -> &[u8] {
        &self.data[prop.data.clone()]
    }
}

/// Everything a bound function owns, torn down as a unit
pub(crate) struct BoundFunction {
    pub(crate) eps: Vec<Arc<LiveEndpoint>>,
    /// Logical interface to configuration interface id
    interface_nums: Vec<Option<u8>>,
    /// Hardware endpoint number to 1-based slot, 0 if unused
    eps_revmap: [u8; 16],
    descriptors: [Option<Vec<Descriptor>>; 3],
    os: Option<OsDescriptors>,
    virtual_addressing: bool,
    addrmap: EndpointMap,
}

impl BoundFunction {
    /// Logical index of configuration interface `id`
    pub(crate) fn revmap_intf(&self, id: u16) -> Option<usize> {
        self.interface_nums
            .iter()
            .position(|num| num.is_some_and(|n| u16::from(n) == id))
    }

    /// Slot of the endpoint addressed by `index`
    pub(crate) fn revmap_ep(&self, index: u16) -> Option<usize> {
        match self.eps_revmap[usize::from(index) & usize::from(ENDPOINT_NUMBER_MASK)] {
            0 => None,
            slot => Some(usize::from(slot)),
        }
    }

    /// Declared address of `slot`
    pub(crate) fn declared_address(&self, slot: usize) -> Option<u8> {
        self.addrmap.address(slot)
    }

    pub(crate) fn virtual_addressing(&self) -> bool {
        self.virtual_addressing
    }

    pub(crate) fn interface_id(&self, logical: usize) -> Option<u8> {
        self.interface_nums.get(logical).copied().flatten()
    }

    pub(crate) fn descriptors(&self, speed: SpeedVariant) -> Option<&[Descriptor]> {
        self.descriptors[speed.index()].as_deref()
    }

    pub(crate) fn descriptor_bytes(&self, speed: SpeedVariant) -> Option<Vec<u8>> {
        self.descriptors(speed).map(encode_all)
    }

    pub(crate) fn os_descriptors(&self) -> Option<&OsDescriptors> {
        self.os.as_ref()
    }
}

#[derive(Default)]
struct SlotBuilder {
    hw: Option<Arc<dyn HwEndpoint>>,
    descs: [Option<EndpointDescriptor>; 3],
    num: u8,
}

/// Build the bound tables of a function
///
/// Nothing is kept on failure; claimed hardware endpoints are returned to
/// the controller's pool by dropping them.
pub(crate) fn bind_function(
    table: &DescriptorTable,
    strings: &[StringTable],
    controller: &dyn Controller,
) -> Result<BoundFunction> {
    let max_speed = controller.max_speed();
    let speeds: Vec<SpeedVariant> = table
        .present_speeds()
        .filter(|speed| speed.min_speed() <= max_speed)
        .collect();
    if speeds.is_empty() {
        return Err(FfsError::NotSupported);
    }

    let virtual_addressing = table.virtual_addressing();
    let mut slots: Vec<SlotBuilder> = (0..table.eps_count).map(|_| SlotBuilder::default()).collect();
    let mut eps_revmap = [0u8; 16];
    let mut descriptors: [Option<Vec<Descriptor>>; 3] = [None, None, None];

    for &speed in &speeds {
        let mut records = table.variant(speed).to_vec();
        for record in &mut records {
            let Descriptor::Endpoint(ep) = record else {
                continue;
            };
            let slot_no = table
                .eps_addrmap
                .slot_of(ep.address)
                .ok_or(FfsError::InvalidArgument("endpoint address missing from map"))?;
            let slot = slots
                .get_mut(slot_no - 1)
                .ok_or(FfsError::InvalidArgument("endpoint slot out of range"))?;
            if slot.descs[speed.index()].is_some() {
                return Err(FfsError::InvalidArgument("duplicate endpoint descriptor"));
            }

            let earlier = slot
                .descs
                .iter()
                .flatten()
                .next()
                .filter(|_| slot.hw.is_some())
                .map(|d| (d.address, d.max_packet_size));
            match earlier {
                Some((address, max_packet_size)) => {
                    ep.address = address;
                    if ep.max_packet_size == 0 {
                        ep.max_packet_size = max_packet_size;
                    }
                }
                None => {
                    let declared = ep.address;
                    let hw = controller
                        .autoconfig(ep)
                        .ok_or(FfsError::OutOfResources)?;
                    eps_revmap[usize::from(ep.address & ENDPOINT_NUMBER_MASK)] = slot_no as u8;
                    slot.num = ep.address;
                    trace!("slot {} claimed {} at 0x{:02x}", slot_no, hw.name(), ep.address);
                    slot.hw = Some(hw);
                    if virtual_addressing {
                        ep.address = declared;
                    }
                }
            }
            slot.descs[speed.index()] = Some(ep.clone());
        }
        descriptors[speed.index()] = Some(records);
    }

    let mut interface_nums: Vec<Option<u8>> = vec![None; table.interfaces_count];
    for records in descriptors.iter_mut().flatten() {
        for record in records.iter_mut() {
            match record {
                Descriptor::Interface(intf) => {
                    intf.interface_number =
                        map_interface(&mut interface_nums, intf.interface_number, controller)?;
                    intf.string_index = map_string(strings, intf.string_index)?;
                }
                Descriptor::InterfaceAssociation(iad) => {
                    iad.first_interface =
                        map_interface(&mut interface_nums, iad.first_interface, controller)?;
                    iad.string_index = map_string(strings, iad.string_index)?;
                }
                _ => {}
            }
        }
    }

    let eps = slots
        .into_iter()
        .map(|slot| match slot.hw {
            Some(hw) => Ok(Arc::new(LiveEndpoint {
                hw,
                descs: slot.descs,
                num: slot.num,
                inflight: Mutex::new(None),
            })),
            None => Err(FfsError::InvalidArgument(
                "endpoint has no descriptor at supported speeds",
            )),
        })
        .collect::<Result<Vec<_>>>()?;

    let os = controller
        .use_os_strings()
        .then(|| bind_os_descriptors(table, &interface_nums));

    info!(
        "Bound function: {} interfaces, {} endpoints, speeds {:?}",
        interface_nums.len(),
        eps.len(),
        speeds
    );
    Ok(BoundFunction {
        eps,
        interface_nums,
        eps_revmap,
        descriptors,
        os,
        virtual_addressing,
        addrmap: table.eps_addrmap,
    })
}

/// Configuration id of logical interface `logical`, allocated on first use
fn map_interface(
    nums: &mut [Option<u8>],
    logical: u8,
    controller: &dyn Controller,
) -> Result<u8> {
    let entry = nums
        .get_mut(usize::from(logical))
        .ok_or(FfsError::InvalidArgument("interface number out of range"))?;
    match entry {
        Some(id) => Ok(*id),
        None => {
            let id = controller.interface_id()?;
            debug!("interface {} -> {}", logical, id);
            *entry = Some(id);
            Ok(id)
        }
    }
}

/// Assigned id of upload string `index` (1-based), 0 stays 0
fn map_string(strings: &[StringTable], index: u8) -> Result<u8> {
    if index == 0 {
        return Ok(0);
    }
    strings
        .first()
        .and_then(|table| table.strings.get(usize::from(index) - 1))
        .map(|string| string.id)
        .ok_or(FfsError::InvalidArgument("string index out of range"))
}

fn bind_os_descriptors(table: &DescriptorTable, interface_nums: &[Option<u8>]) -> OsDescriptors {
    let interface_id = |n: usize| interface_nums.get(n).copied().flatten().unwrap_or(0xff);
    let mut tables: Vec<OsDescTable> = (0..table.interfaces_count)
        .map(|n| OsDescTable {
            interface_id: interface_id(n),
            compatible_id: [0; 8],
            sub_compatible_id: [0; 8],
            ext_prop_count: 0,
            ext_prop_len: 0,
            ext_props: Vec::new(),
        })
        .collect();
    let mut names = Vec::with_capacity(table.ext_props.name_bytes);
    let mut data = Vec::with_capacity(table.ext_props.data_bytes);

    for group in &table.os_groups {
        match &group.features {
            OsFeatures::ExtCompat(records) => {
                for record in records {
                    let n = usize::from(record.first_interface);
                    if let Some(t) = tables.get_mut(n) {
                        t.interface_id = interface_id(n);
                        t.compatible_id = record.compatible_id;
                        t.sub_compatible_id = record.sub_compatible_id;
                    }
                }
            }
            OsFeatures::ExtProp(records) => {
                let n = usize::from(group.interface);
                let Some(t) = tables.get_mut(n) else {
                    continue;
                };
                t.interface_id = interface_id(n);
                for record in records {
                    let name = names.len()..names.len() + record.name.len();
                    names.extend_from_slice(&record.name);
                    let value = data.len()..data.len() + record.data.len();
                    data.extend_from_slice(&record.data);

                    let name_len = record.name.len() * 2;
                    let data_len = if record.data_type.is_unicode() {
                        record.data.len() * 2
                    } else {
                        record.data.len()
                    };
                    t.ext_prop_len += name_len + data_len + protocol::os_desc::EXT_PROP_FIXED_SIZE;
                    t.ext_prop_count += 1;
                    t.ext_props.push(BoundExtProp {
                        data_type: record.data_type,
                        name_len,
                        data_len,
                        name,
                        data: value,
                    });
                }
            }
        }
    }

    OsDescriptors {
        tables,
        names,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackController, LoopbackOptions};
    use common::test_utils::{FixtureEndpoint, FunctionFixture};
    use protocol::{parse_descriptors, parse_strings};

    fn tables(fixture: &FunctionFixture) -> (DescriptorTable, Vec<StringTable>) {
        let table = parse_descriptors(&fixture.descriptors()).unwrap();
        let mut strings = parse_strings(&fixture.strings(), table.strings_count).unwrap();
        for table in &mut strings {
            for (n, string) in table.strings.iter_mut().enumerate() {
                string.id = 10 + n as u8;
            }
        }
        (table, strings)
    }

    #[test]
    fn test_rewrites_interfaces_and_strings() {
        let fixture = FunctionFixture::bulk_loopback().with_interfaces(2).with_endpoints(vec![
            FixtureEndpoint::bulk(0x81),
            FixtureEndpoint::bulk(0x02),
        ]);
        let (table, strings) = tables(&fixture);
        let controller = LoopbackController::new(LoopbackOptions::default());
        controller.reserve_interfaces(3);

        let bound = bind_function(&table, &strings, &controller).unwrap();
        assert_eq!(bound.interface_id(0), Some(3));
        assert_eq!(bound.interface_id(1), Some(4));
        assert_eq!(bound.revmap_intf(4), Some(1));
        assert_eq!(bound.revmap_intf(0), None);

        let full = bound.descriptors(SpeedVariant::Full).unwrap();
        let Descriptor::Interface(second) = &full[2] else {
            panic!("Expected interface record");
        };
        assert_eq!(second.interface_number, 4);
        assert_eq!(second.string_index, 11);
    }

    #[test]
    fn test_endpoints_share_hardware_across_speeds() {
        let (table, strings) = tables(&FunctionFixture::bulk_loopback());
        let controller = LoopbackController::new(LoopbackOptions::default());
        let bound = bind_function(&table, &strings, &controller).unwrap();

        assert_eq!(bound.eps.len(), 2);
        let ep_in = &bound.eps[0];
        let full = ep_in.descs[SpeedVariant::Full.index()].as_ref().unwrap();
        let high = ep_in.descs[SpeedVariant::High.index()].as_ref().unwrap();
        assert_eq!(full.address, high.address);
        assert_eq!(full.address, ep_in.num);
        assert_eq!(high.max_packet_size, 512);
        assert_eq!(bound.revmap_ep(u16::from(ep_in.num)), Some(1));
    }

    #[test]
    fn test_speed_fallback_for_descriptors() {
        let (table, strings) = tables(&FunctionFixture::bulk_loopback());
        let controller = LoopbackController::new(LoopbackOptions::default());
        let bound = bind_function(&table, &strings, &controller).unwrap();
        let ep = &bound.eps[1];
        assert_eq!(ep.descriptor_for(UsbSpeed::Super).unwrap().max_packet_size, 512);
        assert!(ep.exact_descriptor(UsbSpeed::Super).is_none());
        assert_eq!(ep.descriptor_for(UsbSpeed::Full).unwrap().max_packet_size, 64);
    }

    #[test]
    fn test_unsupported_speeds_are_dropped() {
        let fixture = FunctionFixture::bulk_loopback().with_speeds(&[SpeedVariant::High]);
        let (table, strings) = tables(&fixture);
        let controller = LoopbackController::new(LoopbackOptions {
            max_speed: UsbSpeed::Full,
            ..LoopbackOptions::default()
        });
        assert!(matches!(
            bind_function(&table, &strings, &controller),
            Err(FfsError::NotSupported)
        ));
    }

    #[test]
    fn test_autoconfig_exhaustion() {
        let (table, strings) = tables(&FunctionFixture::bulk_loopback());
        let controller = LoopbackController::new(LoopbackOptions {
            endpoints: 1,
            ..LoopbackOptions::default()
        });
        assert!(matches!(
            bind_function(&table, &strings, &controller),
            Err(FfsError::OutOfResources)
        ));
    }

    #[test]
    fn test_virtual_addresses_are_preserved() {
        let fixture = FunctionFixture::bulk_loopback()
            .with_endpoints(vec![FixtureEndpoint::bulk(0x85), FixtureEndpoint::bulk(0x06)])
            .with_virtual_addressing();
        let (table, strings) = tables(&fixture);
        let controller = LoopbackController::new(LoopbackOptions::default());
        controller.reserve_endpoints(&[5, 6]);
        let bound = bind_function(&table, &strings, &controller).unwrap();

        let ep = &bound.eps[0];
        assert_ne!(ep.num & 0x0f, 5);
        assert_eq!(ep.descs[0].as_ref().unwrap().address, 0x85);
        assert_eq!(bound.revmap_ep(u16::from(ep.num)), Some(1));
        assert_eq!(bound.declared_address(1), Some(0x85));
    }

    #[test]
    fn test_os_tables_report_doubled_lengths() {
        let fixture = FunctionFixture::bulk_loopback().with_os_descriptors();
        let (table, strings) = tables(&fixture);
        let controller = LoopbackController::new(LoopbackOptions {
            use_os_strings: true,
            ..LoopbackOptions::default()
        });
        let bound = bind_function(&table, &strings, &controller).unwrap();
        let os = bound.os_descriptors().unwrap();

        let t = &os.tables[0];
        assert_eq!(t.interface_id, bound.interface_id(0).unwrap());
        assert_eq!(&t.compatible_id, b"WINUSB\0\0");
        assert_eq!(t.ext_prop_count, 1);
        let prop = &t.ext_props[0];
        assert_eq!(prop.name_len, 12);
        assert_eq!(prop.data_len, 18);
        assert_eq!(t.ext_prop_len, 12 + 18 + 14);
        assert_eq!(os.prop_name(prop), b"Label\0");
        assert_eq!(os.prop_data(prop), b"loopback\0");
    }

    #[test]
    fn test_os_tables_need_host_request() {
        let fixture = FunctionFixture::bulk_loopback().with_os_descriptors();
        let (table, strings) = tables(&fixture);
        let controller = LoopbackController::new(LoopbackOptions::default());
        let bound = bind_function(&table, &strings, &controller).unwrap();
        assert!(bound.os_descriptors().is_none());
    }
}
