use crate::infrastructure::bluetooth::hal::{HalError, Permission};
use crate::infrastructure::bluetooth::protocol::PacketType;
use thiserror::Error;

/// Why a GATT-level operation failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattFailure {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("required service or characteristics missing")]
    RequiredServiceUnsupported,
    #[error("notification subscription failed")]
    NotificationSetup,
    #[error("write failed")]
    WriteFailed,
    #[error("not connected")]
    NotConnected,
    #[error("status {0}")]
    Status(i32),
    #[error("{0}")]
    Platform(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BondFailureReason {
    #[error("rejected by the OS")]
    Rejected,
    #[error("timed out")]
    Timeout,
    #[error("could not start: {0}")]
    InitiationFailed(String),
}

/// Error taxonomy of the device core. Every variant carries the peripheral
/// address and the failing operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{operation} on {address}: missing permission {permission}")]
    PermissionDenied {
        address: String,
        operation: &'static str,
        permission: Permission,
    },
    #[error("bonding with {address} failed: {reason}")]
    BondFailure {
        address: String,
        reason: BondFailureReason,
    },
    #[error("{operation} on {address} needs authentication (status {status})")]
    InsufficientAuthentication {
        address: String,
        operation: &'static str,
        status: i32,
    },
    #[error("{operation} on {address} failed: {failure}")]
    Gatt {
        address: String,
        operation: &'static str,
        failure: GattFailure,
    },
    #[error("{packet_type:?} request to {address} expired")]
    RequestTimeout {
        address: String,
        packet_type: PacketType,
    },
    #[error("session with {address} closed")]
    SessionClosed { address: String },
    #[error("device {0} not found")]
    NotFound(String),
}

impl DeviceError {
    pub fn gatt(address: &str, operation: &'static str, failure: GattFailure) -> Self {
        Self::Gatt {
            address: address.to_string(),
            operation,
            failure,
        }
    }

    pub fn from_hal(address: &str, operation: &'static str, error: HalError) -> Self {
        let address = address.to_string();
        match error {
            HalError::PermissionDenied(permission) => Self::PermissionDenied {
                address,
                operation,
                permission,
            },
            HalError::InsufficientAuthentication { status } => Self::InsufficientAuthentication {
                address,
                operation,
                status,
            },
            HalError::Gatt { status } => Self::Gatt {
                address,
                operation,
                failure: GattFailure::Status(status),
            },
            HalError::NotConnected => Self::Gatt {
                address,
                operation,
                failure: GattFailure::NotConnected,
            },
            HalError::Unsupported(msg) | HalError::Other(msg) => Self::Gatt {
                address,
                operation,
                failure: GattFailure::Platform(msg),
            },
        }
    }

    pub fn permission(&self) -> Option<Permission> {
        match self {
            Self::PermissionDenied { permission, .. } => Some(*permission),
            _ => None,
        }
    }
}
