//! Platform BLE Abstraction
//!
//! The capability set the core consumes from the host Bluetooth stack:
//! scanning, GATT connections, characteristic access, bonding and
//! bond-state notifications. Platform backends implement [`BleHal`];
//! [`super::simulated::SimulatedBle`] is the in-process implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use uuid::Uuid;

/// Runtime permissions the platform may withhold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Scan,
    Connect,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Scan => write!(f, "BLUETOOTH_SCAN"),
            Permission::Connect => write!(f, "BLUETOOTH_CONNECT"),
        }
    }
}

/// Errors reported by the platform stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("Missing permission {0}")]
    PermissionDenied(Permission),
    #[error("Insufficient authentication (status {status})")]
    InsufficientAuthentication { status: i32 },
    #[error("GATT operation failed with status {status}")]
    Gatt { status: i32 },
    #[error("Not supported: {0}")]
    Unsupported(String),
    #[error("Not connected")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

/// A single advertisement as seen by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    /// Company id -> payload
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: i16,
}

impl Advertisement {
    pub fn named(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

impl From<&BondedDevice> for Advertisement {
    fn from(device: &BondedDevice) -> Self {
        Self {
            address: device.address.clone(),
            name: device.name.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    Unfiltered,
    Services(Vec<Uuid>),
}

impl ScanFilter {
    pub fn accepts(&self, adv: &Advertisement) -> bool {
        match self {
            ScanFilter::Unfiltered => true,
            ScanFilter::Services(uuids) => uuids.iter().any(|u| adv.service_uuids.contains(u)),
        }
    }
}

/// A device the OS holds a bond for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedDevice {
    pub address: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Which bonding strategy got the OS to start pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondMode {
    Insecure,
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

pub type ListenerId = u64;

/// Host Bluetooth stack
#[async_trait]
pub trait BleHal: Send + Sync {
    /// Permissions that are currently not granted
    fn missing_permissions(&self) -> Vec<Permission>;

    /// Start delivering advertisements. Only one scan runs at a time.
    fn start_scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>, HalError>;

    /// Stop the running scan and release its callbacks
    fn stop_scan(&self);

    fn bonded_devices(&self) -> Result<Vec<BondedDevice>, HalError>;

    fn bond_state(&self, address: &str) -> BondState;

    /// Register for bond-state-change signals of one device
    fn register_bond_listener(
        &self,
        address: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<BondState>);

    fn unregister_bond_listener(&self, id: ListenerId);

    /// Bond without MITM protection. `Ok(false)` means the OS refused to start.
    fn create_bond_insecure(&self, address: &str) -> Result<bool, HalError>;

    /// Standard bonding. `Ok(false)` means the OS refused to start.
    fn create_bond(&self, address: &str) -> Result<bool, HalError>;

    fn remove_bond(&self, address: &str) -> Result<(), HalError>;

    /// Open a GATT connection
    async fn connect(
        &self,
        address: &str,
        auto_connect: bool,
    ) -> Result<Arc<dyn GattConnection>, HalError>;

    /// Start bonding, preferring the insecure mode and falling back to
    /// standard bonding when it is unsupported or does not start
    fn initiate_bond(&self, address: &str) -> Result<BondMode, HalError> {
        match self.create_bond_insecure(address) {
            Ok(true) => return Ok(BondMode::Insecure),
            Ok(false) => warn!("Insecure bond with {} did not start", address),
            Err(HalError::PermissionDenied(p)) => return Err(HalError::PermissionDenied(p)),
            Err(e) => warn!("Insecure bond with {} unavailable: {}", address, e),
        }

        if self.create_bond(address)? {
            Ok(BondMode::Standard)
        } else {
            Err(HalError::Other(format!("bond request for {address} refused")))
        }
    }
}

/// One open GATT connection
#[async_trait]
pub trait GattConnection: Send + Sync {
    fn address(&self) -> &str;

    /// Returns the negotiated MTU
    async fn request_mtu(&self, mtu: u16) -> Result<u16, HalError>;

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, HalError>;

    /// Enable notifications. Raw values are pushed without blocking the
    /// platform callback.
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, HalError>;

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8])
        -> Result<(), HalError>;

    /// `true` while the platform considers the link up
    fn connection_status(&self) -> watch::Receiver<bool>;

    async fn disconnect(&self) -> Result<(), HalError>;
}
