//! Display Wire Protocol
//!
//! Identifiers, outgoing command layouts and signature-based classification
//! of incoming notifications for the left/right display peripherals.

use crate::domain::models::{DashboardStatus, GestureKind, TextPage};
use std::fmt;
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

/// Nordic UART-style service carrying every command and notification
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Write characteristic - commands go here
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Notify characteristic - responses and events arrive here
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// SMP firmware management service (diagnostic only, never written)
pub const SMP_SERVICE_UUID: Uuid = Uuid::from_u128(0x8D53DC1D_1DB7_4CD3_868B_8A527460AA84);

/// Legacy DFU service (diagnostic only, never written)
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);

/// Raw opcodes
pub mod opcode {
    pub const EXIT: u8 = 0x18;
    pub const BATTERY: u8 = 0x2C;
    pub const BATTERY_RESPONSE: u8 = 0x66;
    pub const SEND_TEXT: u8 = 0x4E;
    pub const DASHBOARD: u8 = 0x22;
    pub const DASHBOARD_STATUS: u8 = 0x05;
    pub const GESTURE_TAP: u8 = 0x29;
    pub const GESTURE_HOLD: u8 = 0x2B;
}

/// Fixed header of a text page: opcode, sequence, package count, package
/// index, screen status, two character-position bytes
const SEND_TEXT_HEADER: [u8; 7] = [opcode::SEND_TEXT, 0x00, 0x01, 0x00, 0x71, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Exit,
    BatteryLevel,
    SendText,
    DashboardStatus,
    GestureTap,
    GestureHold,
}

impl PacketType {
    /// The outgoing request this incoming type answers, if any.
    /// Gestures and dashboard reports are never correlated.
    pub fn responds_to(self) -> Option<PacketType> {
        match self {
            Self::Exit | Self::BatteryLevel | Self::SendText => Some(self),
            Self::DashboardStatus | Self::GestureTap | Self::GestureHold => None,
        }
    }
}

/// A command ready to be written to the write characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    packet_type: PacketType,
    bytes: Vec<u8>,
}

impl OutgoingPacket {
    pub fn exit() -> Self {
        Self {
            packet_type: PacketType::Exit,
            bytes: vec![opcode::EXIT],
        }
    }

    pub fn battery_level() -> Self {
        Self {
            packet_type: PacketType::BatteryLevel,
            bytes: vec![opcode::BATTERY],
        }
    }

    pub fn send_text(text: &str, page_number: u8, max_pages: u8) -> Self {
        let mut bytes = Vec::with_capacity(SEND_TEXT_HEADER.len() + 2 + text.len());
        bytes.extend_from_slice(&SEND_TEXT_HEADER);
        bytes.push(page_number);
        bytes.push(max_pages);
        bytes.extend_from_slice(text.as_bytes());
        Self {
            packet_type: PacketType::SendText,
            bytes,
        }
    }

    pub fn text_page(page: &TextPage) -> Self {
        Self::send_text(&page.text, page.page_number, page.max_pages)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingPayload {
    Empty,
    /// `None` when the level byte is missing or outside 0-100
    Battery { level: Option<u8> },
    Dashboard(DashboardStatus),
    Gesture {
        kind: GestureKind,
        timestamp: SystemTime,
    },
}

/// A classified notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPacket {
    packet_type: PacketType,
    bytes: Vec<u8>,
    payload: IncomingPayload,
}

impl IncomingPacket {
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn responds_to(&self) -> Option<PacketType> {
        self.packet_type.responds_to()
    }

    pub fn payload(&self) -> &IncomingPayload {
        &self.payload
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Either direction of traffic, as written to trace logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Outgoing(OutgoingPacket),
    Incoming(IncomingPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Outgoing(p) => p.packet_type(),
            Packet::Incoming(p) => p.packet_type(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Packet::Outgoing(p) => p.as_bytes(),
            Packet::Incoming(p) => p.as_bytes(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self {
            Packet::Outgoing(_) => "->",
            Packet::Incoming(_) => "<-",
        };
        write!(f, "{} {:?} [{}]", arrow, self.packet_type(), hex(self.as_bytes()))
    }
}

/// Byte-prefix rule used by [`classify_with`]
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    pub prefix: &'static [u8],
    pub packet_type: PacketType,
}

/// Incoming matchers, most specific prefix first
pub const MATCHERS: &[Matcher] = &[
    Matcher {
        prefix: &[opcode::DASHBOARD, opcode::DASHBOARD_STATUS],
        packet_type: PacketType::DashboardStatus,
    },
    Matcher {
        prefix: &[opcode::BATTERY, opcode::BATTERY_RESPONSE],
        packet_type: PacketType::BatteryLevel,
    },
    Matcher {
        prefix: &[opcode::EXIT],
        packet_type: PacketType::Exit,
    },
    Matcher {
        prefix: &[opcode::SEND_TEXT],
        packet_type: PacketType::SendText,
    },
    Matcher {
        prefix: &[opcode::GESTURE_TAP],
        packet_type: PacketType::GestureTap,
    },
    Matcher {
        prefix: &[opcode::GESTURE_HOLD],
        packet_type: PacketType::GestureHold,
    },
];

/// Return the type of the first matcher whose prefix `bytes` starts with
pub fn classify_with(matchers: &[Matcher], bytes: &[u8]) -> Option<PacketType> {
    matchers
        .iter()
        .find(|m| bytes.starts_with(m.prefix))
        .map(|m| m.packet_type)
}

pub fn classify(bytes: &[u8]) -> Option<PacketType> {
    classify_with(MATCHERS, bytes)
}

/// Classify and decode a raw notification.
///
/// Unrecognised bytes are logged and dropped; this never fails.
pub fn decode(bytes: &[u8]) -> Option<IncomingPacket> {
    let Some(packet_type) = classify(bytes) else {
        debug!("Dropping unrecognised notification: {}", hex(bytes));
        return None;
    };

    let payload = match packet_type {
        PacketType::BatteryLevel => IncomingPayload::Battery {
            level: bytes.get(2).copied().filter(|level| *level <= 100),
        },
        PacketType::DashboardStatus => IncomingPayload::Dashboard(DashboardStatus {
            countdown_ticks: read_u16_le(bytes, 2),
            current_page: read_u16_le(bytes, 4),
            total_pages: read_u16_le(bytes, 6),
        }),
        PacketType::GestureTap => IncomingPayload::Gesture {
            kind: GestureKind::Tap,
            timestamp: SystemTime::now(),
        },
        PacketType::GestureHold => IncomingPayload::Gesture {
            kind: GestureKind::Hold,
            timestamp: SystemTime::now(),
        },
        PacketType::Exit | PacketType::SendText => IncomingPayload::Empty,
    };

    Some(IncomingPacket {
        packet_type,
        bytes: bytes.to_vec(),
        payload,
    })
}

fn read_u16_le(bytes: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    let b = bytes.get(offset..end)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Space separated upper-case hex, for logs
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bytes() {
        assert_eq!(OutgoingPacket::exit().as_bytes(), &[0x18]);
        assert_eq!(OutgoingPacket::battery_level().as_bytes(), &[0x2C]);
        assert_eq!(
            OutgoingPacket::battery_level().packet_type(),
            PacketType::BatteryLevel
        );
    }

    #[test]
    fn test_send_text_layout() {
        let packet = OutgoingPacket::send_text("hé", 2, 5);
        assert_eq!(
            packet.as_bytes(),
            &[0x4E, 0x00, 0x01, 0x00, 0x71, 0x00, 0x00, 0x02, 0x05, b'h', 0xC3, 0xA9]
        );
        assert_eq!(packet.packet_type(), PacketType::SendText);

        let page = TextPage {
            text: "hé".to_string(),
            page_number: 2,
            max_pages: 5,
        };
        assert_eq!(OutgoingPacket::text_page(&page), packet);
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            NOTIFY_CHAR_UUID.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            DFU_SERVICE_UUID.to_string(),
            "00001530-1212-efde-1523-785feabcd123"
        );
    }

    #[test]
    fn test_short_inputs_never_fault() {
        assert_eq!(decode(&[]), None);
        for a in 0..=u8::MAX {
            let one = [a];
            let _ = decode(&one);
            for b in 0..=u8::MAX {
                let two = [a, b];
                if let Some(packet) = decode(&two) {
                    if let IncomingPayload::Dashboard(status) = packet.payload() {
                        assert_eq!(*status, DashboardStatus::default());
                    }
                }
            }
        }
        // A lone battery opcode is a request echo, not a response
        assert_eq!(classify(&[0x2C]), None);
        assert_eq!(classify(&[0x22]), None);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let samples: [&[u8]; 5] = [
            &[0x2C, 0x66, 0x50],
            &[0x22, 0x05, 1, 0, 2, 0, 3, 0],
            &[0x4E, 0xC9],
            &[0x29],
            &[0x7F, 0x00],
        ];
        for bytes in samples {
            assert_eq!(classify(bytes), classify(bytes));
        }
    }

    #[test]
    fn test_declared_first_rule_wins() {
        let overlapping = [
            Matcher {
                prefix: &[0x4E],
                packet_type: PacketType::SendText,
            },
            Matcher {
                prefix: &[0x4E, 0xC9],
                packet_type: PacketType::Exit,
            },
        ];
        assert_eq!(
            classify_with(&overlapping, &[0x4E, 0xC9]),
            Some(PacketType::SendText)
        );

        // The shipped table lists every two-byte prefix before any one-byte prefix
        let first_single = MATCHERS.iter().position(|m| m.prefix.len() == 1).unwrap();
        assert!(MATCHERS[first_single..].iter().all(|m| m.prefix.len() == 1));
    }

    #[test]
    fn test_battery_decode() {
        let packet = decode(&[0x2C, 0x66, 87, 0x00]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::BatteryLevel);
        assert_eq!(packet.payload(), &IncomingPayload::Battery { level: Some(87) });
        assert_eq!(packet.responds_to(), Some(PacketType::BatteryLevel));

        let truncated = decode(&[0x2C, 0x66]).unwrap();
        assert_eq!(truncated.payload(), &IncomingPayload::Battery { level: None });

        let out_of_range = decode(&[0x2C, 0x66, 180]).unwrap();
        assert_eq!(out_of_range.payload(), &IncomingPayload::Battery { level: None });
    }

    #[test]
    fn test_dashboard_decode() {
        let full = decode(&[0x22, 0x05, 0x10, 0x01, 0x02, 0x00, 0x07, 0x00]).unwrap();
        assert_eq!(
            full.payload(),
            &IncomingPayload::Dashboard(DashboardStatus {
                countdown_ticks: Some(0x0110),
                current_page: Some(2),
                total_pages: Some(7),
            })
        );
        assert_eq!(full.responds_to(), None);

        let partial = decode(&[0x22, 0x05, 0x10, 0x01, 0x02]).unwrap();
        assert_eq!(
            partial.payload(),
            &IncomingPayload::Dashboard(DashboardStatus {
                countdown_ticks: Some(0x0110),
                current_page: None,
                total_pages: None,
            })
        );
    }

    #[test]
    fn test_gestures_are_unsolicited() {
        let tap = decode(&[0x29, 0x01]).unwrap();
        let hold = decode(&[0x2B]).unwrap();
        assert_eq!(tap.responds_to(), None);
        assert_eq!(hold.responds_to(), None);
        assert!(matches!(
            hold.payload(),
            IncomingPayload::Gesture {
                kind: GestureKind::Hold,
                ..
            }
        ));
    }

    #[test]
    fn test_responses_correlate_with_requests() {
        assert_eq!(
            decode(&[0x18, 0xC9]).unwrap().responds_to(),
            Some(OutgoingPacket::exit().packet_type())
        );
        assert_eq!(
            decode(&[0x4E, 0xC9]).unwrap().responds_to(),
            Some(PacketType::SendText)
        );
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x2C, 0x06, 0xFF]), "2C 06 FF");
        assert_eq!(hex(&[]), "");
        let packet = Packet::Outgoing(OutgoingPacket::exit());
        assert_eq!(packet.packet_type(), PacketType::Exit);
        assert_eq!(packet.as_bytes(), &[0x18]);
        assert_eq!(packet.to_string(), "-> Exit [18]");

        let incoming = Packet::Incoming(decode(&[0x2C, 0x66, 50]).unwrap());
        assert_eq!(incoming.to_string(), "<- BatteryLevel [2C 66 32]");
    }
}
