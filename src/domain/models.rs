use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Connection state of a link, a session or a composed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 6] = [
        ConnectionState::Uninitialized,
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnecting,
        ConnectionState::Error,
    ];
}

/// Which half of the wearable a peripheral drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Charge level, 0-100
    pub level: u8,
    pub updated_at: SystemTime,
}

/// Dashboard status report pushed by the display.
///
/// Every field is optional: a truncated report leaves the unreadable
/// fields empty instead of failing the whole packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DashboardStatus {
    pub countdown_ticks: Option<u16>,
    pub current_page: Option<u16>,
    pub total_pages: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GestureKind {
    Tap,
    Hold,
}

/// One pre-formatted page of text for the display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPage {
    pub text: String,
    /// 1-based page number
    pub page_number: u8,
    pub max_pages: u8,
}

impl TextPage {
    pub fn single(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page_number: 1,
            max_pages: 1,
        }
    }
}

/// Events published upward to the surrounding application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    ConnectionState {
        device_id: String,
        state: ConnectionState,
    },
    Battery {
        device_id: String,
        side: Side,
        level: u8,
    },
    Gesture {
        device_id: String,
        side: Side,
        kind: GestureKind,
        timestamp: SystemTime,
    },
    Dashboard {
        device_id: String,
        side: Side,
        status: DashboardStatus,
    },
}

/// Snapshot of a logical (left + right) device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub serial: String,
    pub left_address: String,
    pub right_address: String,
    pub state: ConnectionState,
}
