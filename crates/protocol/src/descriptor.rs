//! Typed USB descriptor records
//!
//! Only the kinds a function may declare are representable. Device-level
//! records (device, configuration, string, qualifier) are rejected at decode.

use crate::error::{ProtocolError, Result};
use crate::types::{Direction, TransferType};
use bytes::{Buf, BufMut};
use serde::Serialize;

/// bDescriptorType values
pub mod kind {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIG: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const DEVICE_QUALIFIER: u8 = 0x06;
    pub const OTHER_SPEED_CONFIG: u8 = 0x07;
    pub const INTERFACE_POWER: u8 = 0x08;
    pub const OTG: u8 = 0x09;
    pub const DEBUG: u8 = 0x0a;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0b;
    pub const SECURITY: u8 = 0x0c;
    pub const HID: u8 = 0x21;
    pub const CS_RADIO_CONTROL: u8 = 0x23;
    pub const SS_ENDPOINT_COMP: u8 = 0x30;
}

pub const INTERFACE_SIZE: u8 = 9;
pub const ENDPOINT_SIZE: u8 = 7;
pub const ENDPOINT_AUDIO_SIZE: u8 = 9;
pub const INTERFACE_ASSOC_SIZE: u8 = 8;
pub const HID_SIZE: u8 = 9;
pub const OTG_SIZE: u8 = 3;
pub const OTG20_SIZE: u8 = 5;
pub const SS_ENDPOINT_COMP_SIZE: u8 = 6;

/// Mask selecting the endpoint number from bEndpointAddress
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// iInterface, 0 when absent
    pub string_index: u8,
}

/// Trailing fields of the 9-byte audio endpoint layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioEndpointExt {
    pub refresh: u8,
    pub synch_address: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub audio: Option<AudioEndpointExt>,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    pub fn is_isochronous(&self) -> bool {
        self.transfer_type() == TransferType::Isochronous
    }

    /// Packet size bits of wMaxPacketSize (high-bandwidth multiplier stripped)
    pub fn max_packet(&self) -> u16 {
        self.max_packet_size & 0x07ff
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAssocDescriptor {
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
    /// iFunction, 0 when absent
    pub string_index: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HidDescriptor {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub num_descriptors: u8,
    pub class_descriptor_type: u8,
    pub class_descriptor_length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtgDescriptor {
    pub attributes: u8,
    /// Present in the 5-byte OTG 2.0 layout
    pub bcd_otg: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SsEndpointCompanion {
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

/// One descriptor record of a speed variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    InterfaceAssociation(InterfaceAssocDescriptor),
    Hid(HidDescriptor),
    Otg(OtgDescriptor),
    SsEndpointCompanion(SsEndpointCompanion),
}

impl Descriptor {
    /// Decode one self-length-prefixed record from the front of `data`.
    ///
    /// Returns the descriptor and the number of bytes it occupied.
    pub fn decode(data: &[u8]) -> Result<(Descriptor, usize)> {
        if data.len() < 2 {
            return Err(ProtocolError::truncated("descriptor header", 2, data.len()));
        }
        let length = data[0];
        let ty = data[1];
        if length < 2 {
            return Err(ProtocolError::ShortDescriptor(length));
        }
        let total = usize::from(length);
        if total > data.len() {
            return Err(ProtocolError::truncated("descriptor", total, data.len()));
        }

        let expect = |valid: &[u8]| -> Result<()> {
            if valid.contains(&length) {
                Ok(())
            } else {
                Err(ProtocolError::BadDescriptorLength { kind: ty, length })
            }
        };
        let mut body = &data[2..total];

        let desc = match ty {
            kind::DEVICE | kind::CONFIG | kind::STRING | kind::DEVICE_QUALIFIER => {
                return Err(ProtocolError::ReservedDescriptor(ty));
            }
            kind::INTERFACE => {
                expect(&[INTERFACE_SIZE])?;
                Descriptor::Interface(InterfaceDescriptor {
                    interface_number: body.get_u8(),
                    alternate_setting: body.get_u8(),
                    num_endpoints: body.get_u8(),
                    class: body.get_u8(),
                    subclass: body.get_u8(),
                    protocol: body.get_u8(),
                    string_index: body.get_u8(),
                })
            }
            kind::ENDPOINT => {
                expect(&[ENDPOINT_SIZE, ENDPOINT_AUDIO_SIZE])?;
                let address = body.get_u8();
                let attributes = body.get_u8();
                let max_packet_size = body.get_u16_le();
                let interval = body.get_u8();
                let audio = if length == ENDPOINT_AUDIO_SIZE {
                    Some(AudioEndpointExt {
                        refresh: body.get_u8(),
                        synch_address: body.get_u8(),
                    })
                } else {
                    None
                };
                Descriptor::Endpoint(EndpointDescriptor {
                    address,
                    attributes,
                    max_packet_size,
                    interval,
                    audio,
                })
            }
            kind::INTERFACE_ASSOCIATION => {
                expect(&[INTERFACE_ASSOC_SIZE])?;
                Descriptor::InterfaceAssociation(InterfaceAssocDescriptor {
                    first_interface: body.get_u8(),
                    interface_count: body.get_u8(),
                    function_class: body.get_u8(),
                    function_subclass: body.get_u8(),
                    function_protocol: body.get_u8(),
                    string_index: body.get_u8(),
                })
            }
            kind::HID => {
                expect(&[HID_SIZE])?;
                Descriptor::Hid(HidDescriptor {
                    bcd_hid: body.get_u16_le(),
                    country_code: body.get_u8(),
                    num_descriptors: body.get_u8(),
                    class_descriptor_type: body.get_u8(),
                    class_descriptor_length: body.get_u16_le(),
                })
            }
            kind::OTG => {
                expect(&[OTG_SIZE, OTG20_SIZE])?;
                let attributes = body.get_u8();
                let bcd_otg = (length == OTG20_SIZE).then(|| body.get_u16_le());
                Descriptor::Otg(OtgDescriptor {
                    attributes,
                    bcd_otg,
                })
            }
            kind::SS_ENDPOINT_COMP => {
                expect(&[SS_ENDPOINT_COMP_SIZE])?;
                Descriptor::SsEndpointCompanion(SsEndpointCompanion {
                    max_burst: body.get_u8(),
                    attributes: body.get_u8(),
                    bytes_per_interval: body.get_u16_le(),
                })
            }
            _ => return Err(ProtocolError::UnsupportedDescriptor(ty)),
        };

        Ok((desc, total))
    }

    /// bDescriptorType of this record
    pub fn kind(&self) -> u8 {
        match self {
            Descriptor::Interface(_) => kind::INTERFACE,
            Descriptor::Endpoint(_) => kind::ENDPOINT,
            Descriptor::InterfaceAssociation(_) => kind::INTERFACE_ASSOCIATION,
            Descriptor::Hid(_) => kind::HID,
            Descriptor::Otg(_) => kind::OTG,
            Descriptor::SsEndpointCompanion(_) => kind::SS_ENDPOINT_COMP,
        }
    }

    /// bLength of this record
    pub fn length(&self) -> u8 {
        match self {
            Descriptor::Interface(_) => INTERFACE_SIZE,
            Descriptor::Endpoint(ep) if ep.audio.is_some() => ENDPOINT_AUDIO_SIZE,
            Descriptor::Endpoint(_) => ENDPOINT_SIZE,
            Descriptor::InterfaceAssociation(_) => INTERFACE_ASSOC_SIZE,
            Descriptor::Hid(_) => HID_SIZE,
            Descriptor::Otg(otg) if otg.bcd_otg.is_some() => OTG20_SIZE,
            Descriptor::Otg(_) => OTG_SIZE,
            Descriptor::SsEndpointCompanion(_) => SS_ENDPOINT_COMP_SIZE,
        }
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.length());
        out.put_u8(self.kind());
        match self {
            Descriptor::Interface(d) => {
                out.put_u8(d.interface_number);
                out.put_u8(d.alternate_setting);
                out.put_u8(d.num_endpoints);
                out.put_u8(d.class);
                out.put_u8(d.subclass);
                out.put_u8(d.protocol);
                out.put_u8(d.string_index);
            }
            Descriptor::Endpoint(d) => {
                out.put_u8(d.address);
                out.put_u8(d.attributes);
                out.put_u16_le(d.max_packet_size);
                out.put_u8(d.interval);
                if let Some(audio) = d.audio {
                    out.put_u8(audio.refresh);
                    out.put_u8(audio.synch_address);
                }
            }
            Descriptor::InterfaceAssociation(d) => {
                out.put_u8(d.first_interface);
                out.put_u8(d.interface_count);
                out.put_u8(d.function_class);
                out.put_u8(d.function_subclass);
                out.put_u8(d.function_protocol);
                out.put_u8(d.string_index);
            }
            Descriptor::Hid(d) => {
                out.put_u16_le(d.bcd_hid);
                out.put_u8(d.country_code);
                out.put_u8(d.num_descriptors);
                out.put_u8(d.class_descriptor_type);
                out.put_u16_le(d.class_descriptor_length);
            }
            Descriptor::Otg(d) => {
                out.put_u8(d.attributes);
                if let Some(bcd) = d.bcd_otg {
                    out.put_u16_le(bcd);
                }
            }
            Descriptor::SsEndpointCompanion(d) => {
                out.put_u8(d.max_burst);
                out.put_u8(d.attributes);
                out.put_u16_le(d.bytes_per_interval);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(usize::from(self.length()));
        self.encode(&mut out);
        out
    }

    pub fn as_endpoint(&self) -> Option<&EndpointDescriptor> {
        match self {
            Descriptor::Endpoint(ep) => Some(ep),
            _ => None,
        }
    }
}

/// Encode a whole descriptor list back to back
pub fn encode_all(descs: &[Descriptor]) -> Vec<u8> {
    let mut out = Vec::with_capacity(descs.iter().map(|d| usize::from(d.length())).sum());
    for desc in descs {
        desc.encode(&mut out);
    }
    out
}
