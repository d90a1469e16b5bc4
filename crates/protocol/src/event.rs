//! Setup packets and control event records

use crate::error::{ProtocolError, Result};
use crate::types::Direction;
use crate::wire::{EVENT_SIZE, SETUP_PACKET_SIZE};
use serde::{Deserialize, Serialize};

/// bmRequestType recipient field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Control request received from the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < SETUP_PACKET_SIZE {
            return Err(ProtocolError::truncated(
                "setup packet",
                SETUP_PACKET_SIZE,
                raw.len(),
            ));
        }
        Ok(Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Data stage direction
    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.request_type)
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }
}

/// Control event vocabulary, in wire numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Bind = 0,
    Unbind = 1,
    Enable = 2,
    Disable = 3,
    Setup = 4,
    Suspend = 5,
    Resume = 6,
}

impl EventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => EventType::Bind,
            1 => EventType::Unbind,
            2 => EventType::Enable,
            3 => EventType::Disable,
            4 => EventType::Setup,
            5 => EventType::Suspend,
            6 => EventType::Resume,
            _ => return None,
        })
    }

    /// Suspend and resume are the power-management pair
    pub fn is_power(self) -> bool {
        matches!(self, EventType::Suspend | EventType::Resume)
    }
}

/// Event record as returned by a control-channel read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub kind: EventType,
    /// Only present for `EventType::Setup`
    pub setup: Option<SetupPacket>,
}

impl ControlEvent {
    pub fn new(kind: EventType) -> Self {
        Self { kind, setup: None }
    }

    pub fn setup(packet: SetupPacket) -> Self {
        Self {
            kind: EventType::Setup,
            setup: Some(packet),
        }
    }

    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        let mut out = [0u8; EVENT_SIZE];
        if let Some(setup) = &self.setup {
            out[..SETUP_PACKET_SIZE].copy_from_slice(&setup.to_bytes());
        }
        out[SETUP_PACKET_SIZE] = self.kind as u8;
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < EVENT_SIZE {
            return Err(ProtocolError::truncated("event record", EVENT_SIZE, raw.len()));
        }
        let kind = EventType::from_u8(raw[SETUP_PACKET_SIZE])
            .ok_or(ProtocolError::UnknownEvent(raw[SETUP_PACKET_SIZE]))?;
        let setup = match kind {
            EventType::Setup => Some(SetupPacket::parse(raw)?),
            _ => None,
        };
        Ok(Self { kind, setup })
    }

    /// Decode a buffer of back-to-back event records
    pub fn parse_all(raw: &[u8]) -> Result<Vec<Self>> {
        raw.chunks(EVENT_SIZE).map(Self::parse).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_fields() {
        let raw = [0xc1, 0x01, 0x34, 0x12, 0x02, 0x00, 0x40, 0x00];
        let setup = SetupPacket::parse(&raw).unwrap();
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert_eq!(setup.value, 0x1234);
        assert_eq!(setup.index, 2);
        assert_eq!(setup.length, 64);
        assert_eq!(setup.to_bytes(), raw);
    }

    #[test]
    fn test_event_record_layout() {
        let setup = SetupPacket {
            request_type: 0x42,
            request: 0x09,
            value: 1,
            index: 0x81,
            length: 0,
        };
        let raw = ControlEvent::setup(setup).to_bytes();
        assert_eq!(raw.len(), EVENT_SIZE);
        assert_eq!(raw[8], 4);
        assert_eq!(&raw[9..], &[0, 0, 0]);
        assert_eq!(raw[4], 0x81);

        let enable = ControlEvent::new(EventType::Enable).to_bytes();
        assert_eq!(enable, [0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_parse_all_records() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ControlEvent::new(EventType::Bind).to_bytes());
        raw.extend_from_slice(&ControlEvent::new(EventType::Resume).to_bytes());
        let events = ControlEvent::parse_all(&raw).unwrap();
        assert_eq!(events[0].kind, EventType::Bind);
        assert_eq!(events[1].kind, EventType::Resume);
        assert!(events[1].setup.is_none());
    }

    #[test]
    fn test_power_pair() {
        assert!(EventType::Suspend.is_power());
        assert!(EventType::Resume.is_power());
        assert!(!EventType::Setup.is_power());
        assert_eq!(EventType::from_u8(7), None);
    }
}
