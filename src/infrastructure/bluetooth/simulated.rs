//! Simulated BLE Stack
//!
//! An in-process [`BleHal`] with scripted peripherals. Used by the unit
//! tests and by the demo binary.

use crate::infrastructure::bluetooth::hal::{
    Advertisement, BleHal, BondState, BondedDevice, CharacteristicInfo,
    CharacteristicProperties, GattConnection, HalError, ListenerId, Permission, ScanFilter,
    ServiceInfo,
};
use crate::infrastructure::bluetooth::protocol::{
    self, opcode, NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

/// How a peripheral reacts to a bond request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondBehavior {
    /// Signals Bonding then Bonded
    Accept,
    /// Signals Bonding then None
    Reject,
    /// Becomes bonded but never signals
    CompleteSilently,
    /// Signals Bonding and never finishes
    Hang,
    /// The OS refuses to start bonding
    RefuseToStart,
}

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub address: String,
    pub name: String,
    pub services: Vec<ServiceInfo>,
    pub advertised_services: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub advertising: bool,
    pub bonded: bool,
    pub bond_behavior: BondBehavior,
    pub insecure_bond_supported: bool,
    /// Connects left to fail with insufficient authentication
    pub auth_failures: u32,
    /// Writes left to fail
    pub write_failures: u32,
    pub hang_on_connect: bool,
    /// Time service discovery takes
    pub discovery_delay: Duration,
    /// Answer exit, battery and text commands automatically
    pub auto_respond: bool,
    pub battery_level: u8,
}

impl SimulatedPeripheral {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            services: vec![display_service()],
            advertised_services: vec![SERVICE_UUID],
            manufacturer_data: HashMap::new(),
            advertising: true,
            bonded: false,
            bond_behavior: BondBehavior::Accept,
            insecure_bond_supported: true,
            auth_failures: 0,
            write_failures: 0,
            hang_on_connect: false,
            discovery_delay: Duration::ZERO,
            auto_respond: true,
            battery_level: 80,
        }
    }

    pub fn bonded(mut self) -> Self {
        self.bonded = true;
        self
    }

    pub fn with_bond_behavior(mut self, behavior: BondBehavior) -> Self {
        self.bond_behavior = behavior;
        self
    }

    pub fn without_insecure_bond(mut self) -> Self {
        self.insecure_bond_supported = false;
        self
    }

    pub fn with_auth_failures(mut self, count: u32) -> Self {
        self.auth_failures = count;
        self
    }

    pub fn with_write_failures(mut self, count: u32) -> Self {
        self.write_failures = count;
        self
    }

    pub fn with_services(mut self, services: Vec<ServiceInfo>) -> Self {
        self.services = services;
        self
    }

    pub fn advertising_services(mut self, uuids: Vec<Uuid>) -> Self {
        self.advertised_services = uuids;
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    pub fn not_advertising(mut self) -> Self {
        self.advertising = false;
        self
    }

    pub fn hang_on_connect(mut self) -> Self {
        self.hang_on_connect = true;
        self
    }

    pub fn with_discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = delay;
        self
    }

    pub fn silent(mut self) -> Self {
        self.auto_respond = false;
        self
    }

    pub fn with_battery_level(mut self, level: u8) -> Self {
        self.battery_level = level;
        self
    }

    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            address: self.address.clone(),
            name: Some(self.name.clone()),
            service_uuids: self.advertised_services.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
            rssi: -60,
        }
    }
}

/// The display service with correctly flagged characteristics
pub fn display_service() -> ServiceInfo {
    ServiceInfo {
        uuid: SERVICE_UUID,
        characteristics: vec![
            CharacteristicInfo {
                uuid: WRITE_CHAR_UUID,
                properties: CharacteristicProperties {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
            },
            CharacteristicInfo {
                uuid: NOTIFY_CHAR_UUID,
                properties: CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            },
        ],
    }
}

#[derive(Default)]
struct SimState {
    peripherals: Vec<SimulatedPeripheral>,
    missing_permissions: Vec<Permission>,
    scan: Option<(ScanFilter, mpsc::UnboundedSender<Advertisement>)>,
    scan_starts: usize,
    scan_stops: usize,
    listeners: HashMap<ListenerId, (String, mpsc::UnboundedSender<BondState>)>,
    next_listener: ListenerId,
    listener_registrations: usize,
    listener_deregistrations: usize,
    bond_removals: Vec<String>,
    connect_attempts: HashMap<String, u32>,
    links: HashMap<String, Arc<SimConnection>>,
    writes: Vec<(String, Vec<u8>)>,
}

impl SimState {
    fn peripheral_mut(&mut self, address: &str) -> Option<&mut SimulatedPeripheral> {
        self.peripherals.iter_mut().find(|p| p.address == address)
    }

    fn signal_bond(&self, address: &str, state: BondState) {
        for (listener_address, tx) in self.listeners.values() {
            if listener_address == address {
                let _ = tx.send(state);
            }
        }
    }

    fn begin_bond(&mut self, address: &str) -> Result<bool, HalError> {
        let peripheral = self
            .peripheral_mut(address)
            .ok_or_else(|| HalError::Other(format!("unknown device {address}")))?;

        let signals: &[BondState] = match peripheral.bond_behavior {
            BondBehavior::RefuseToStart => return Ok(false),
            BondBehavior::Accept => {
                peripheral.bonded = true;
                &[BondState::Bonding, BondState::Bonded]
            }
            BondBehavior::Reject => &[BondState::Bonding, BondState::None],
            BondBehavior::CompleteSilently => {
                peripheral.bonded = true;
                &[]
            }
            BondBehavior::Hang => &[BondState::Bonding],
        };

        for state in signals {
            self.signal_bond(address, *state);
        }
        Ok(true)
    }
}

/// In-process BLE stack
#[derive(Clone, Default)]
pub struct SimulatedBle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.state.lock().peripherals.push(peripheral);
    }

    pub fn update_peripheral(&self, address: &str, f: impl FnOnce(&mut SimulatedPeripheral)) {
        if let Some(p) = self.state.lock().peripheral_mut(address) {
            f(p);
        }
    }

    pub fn set_missing_permissions(&self, permissions: Vec<Permission>) {
        self.state.lock().missing_permissions = permissions;
    }

    /// Deliver an extra advertisement to the running scan
    pub fn advertise(&self, adv: Advertisement) -> bool {
        let state = self.state.lock();
        match &state.scan {
            Some((filter, tx)) if filter.accepts(&adv) => tx.send(adv).is_ok(),
            _ => false,
        }
    }

    /// Push a raw notification from a connected peripheral
    pub fn notify(&self, address: &str, bytes: &[u8]) -> bool {
        let link = self.state.lock().links.get(address).cloned();
        link.map(|l| l.push(bytes.to_vec())).unwrap_or(false)
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self, address: &str) {
        let link = self.state.lock().links.remove(address);
        if let Some(link) = link {
            link.close();
        }
    }

    pub fn writes_to(&self, address: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn scan_starts(&self) -> usize {
        self.state.lock().scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        self.state.lock().scan_stops
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan.is_some()
    }

    pub fn listener_registrations(&self) -> usize {
        self.state.lock().listener_registrations
    }

    pub fn listener_deregistrations(&self) -> usize {
        self.state.lock().listener_deregistrations
    }

    pub fn active_listeners(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn connect_attempts(&self, address: &str) -> u32 {
        self.state
            .lock()
            .connect_attempts
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn bond_removals(&self) -> Vec<String> {
        self.state.lock().bond_removals.clone()
    }

    pub fn is_bonded(&self, address: &str) -> bool {
        self.state
            .lock()
            .peripheral_mut(address)
            .map(|p| p.bonded)
            .unwrap_or(false)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state.lock().links.contains_key(address)
    }

    fn check_permission(&self, permission: Permission) -> Result<(), HalError> {
        if self.state.lock().missing_permissions.contains(&permission) {
            Err(HalError::PermissionDenied(permission))
        } else {
            Ok(())
        }
    }

    /// Record a write and produce the scripted response, if any
    fn handle_write(&self, address: &str, data: &[u8]) -> Result<Option<Vec<u8>>, HalError> {
        let mut state = self.state.lock();
        state.writes.push((address.to_string(), data.to_vec()));
        let peripheral = state.peripheral_mut(address).ok_or(HalError::NotConnected)?;

        if peripheral.write_failures > 0 {
            peripheral.write_failures -= 1;
            return Err(HalError::Gatt { status: 1 });
        }
        if !peripheral.auto_respond {
            return Ok(None);
        }

        let response = match data.first().copied() {
            Some(opcode::EXIT) => Some(vec![opcode::EXIT, 0xC9]),
            Some(opcode::BATTERY) => Some(vec![
                opcode::BATTERY,
                opcode::BATTERY_RESPONSE,
                peripheral.battery_level,
            ]),
            Some(opcode::SEND_TEXT) => Some(vec![opcode::SEND_TEXT, 0xC9]),
            _ => None,
        };
        Ok(response)
    }
}

#[async_trait]
impl BleHal for SimulatedBle {
    fn missing_permissions(&self) -> Vec<Permission> {
        self.state.lock().missing_permissions.clone()
    }

    fn start_scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>, HalError> {
        self.check_permission(Permission::Scan)?;
        let mut state = self.state.lock();
        state.scan_starts += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        for peripheral in state.peripherals.iter().filter(|p| p.advertising) {
            let adv = peripheral.advertisement();
            if filter.accepts(&adv) {
                let _ = tx.send(adv);
            }
        }
        state.scan = Some((filter.clone(), tx));
        debug!("Simulated scan started ({:?})", filter);
        Ok(rx)
    }

    fn stop_scan(&self) {
        let mut state = self.state.lock();
        state.scan = None;
        state.scan_stops += 1;
    }

    fn bonded_devices(&self) -> Result<Vec<BondedDevice>, HalError> {
        self.check_permission(Permission::Connect)?;
        Ok(self
            .state
            .lock()
            .peripherals
            .iter()
            .filter(|p| p.bonded)
            .map(|p| BondedDevice {
                address: p.address.clone(),
                name: Some(p.name.clone()),
            })
            .collect())
    }

    fn bond_state(&self, address: &str) -> BondState {
        if self.is_bonded(address) {
            BondState::Bonded
        } else {
            BondState::None
        }
    }

    fn register_bond_listener(
        &self,
        address: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<BondState>) {
        let mut state = self.state.lock();
        let id = state.next_listener;
        state.next_listener += 1;
        state.listener_registrations += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(id, (address.to_string(), tx));
        (id, rx)
    }

    fn unregister_bond_listener(&self, id: ListenerId) {
        let mut state = self.state.lock();
        state.listener_deregistrations += 1;
        state.listeners.remove(&id);
    }

    fn create_bond_insecure(&self, address: &str) -> Result<bool, HalError> {
        self.check_permission(Permission::Connect)?;
        let mut state = self.state.lock();
        let supported = state
            .peripheral_mut(address)
            .map(|p| p.insecure_bond_supported)
            .unwrap_or(false);
        if !supported {
            return Err(HalError::Unsupported("insecure bonding".to_string()));
        }
        state.begin_bond(address)
    }

    fn create_bond(&self, address: &str) -> Result<bool, HalError> {
        self.check_permission(Permission::Connect)?;
        self.state.lock().begin_bond(address)
    }

    fn remove_bond(&self, address: &str) -> Result<(), HalError> {
        let mut state = self.state.lock();
        state.bond_removals.push(address.to_string());
        if let Some(p) = state.peripheral_mut(address) {
            p.bonded = false;
        }
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        _auto_connect: bool,
    ) -> Result<Arc<dyn GattConnection>, HalError> {
        self.check_permission(Permission::Connect)?;

        let hang = {
            let mut state = self.state.lock();
            *state
                .connect_attempts
                .entry(address.to_string())
                .or_insert(0) += 1;
            let peripheral = state
                .peripheral_mut(address)
                .ok_or(HalError::Gatt { status: 133 })?;
            if peripheral.auth_failures > 0 {
                peripheral.auth_failures -= 1;
                return Err(HalError::InsufficientAuthentication { status: 5 });
            }
            peripheral.hang_on_connect
        };

        if hang {
            std::future::pending::<()>().await;
        }

        let connection = Arc::new(SimConnection::new(address, self.clone()));
        self.state
            .lock()
            .links
            .insert(address.to_string(), connection.clone());
        Ok(connection)
    }
}

struct SimConnection {
    address: String,
    ble: SimulatedBle,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    status_tx: watch::Sender<bool>,
}

impl SimConnection {
    fn new(address: &str, ble: SimulatedBle) -> Self {
        let (status_tx, _) = watch::channel(true);
        Self {
            address: address.to_string(),
            ble,
            notify_tx: Mutex::new(None),
            status_tx,
        }
    }

    fn push(&self, bytes: Vec<u8>) -> bool {
        match self.notify_tx.lock().as_ref() {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.notify_tx.lock().take();
        self.status_tx.send_replace(false);
    }
}

#[async_trait]
impl GattConnection for SimConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16, HalError> {
        Ok(mtu.min(247))
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, HalError> {
        let delay = self
            .ble
            .state
            .lock()
            .peripheral_mut(&self.address)
            .map(|p| p.discovery_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.ble.state.lock();
        state
            .peripheral_mut(&self.address)
            .map(|p| p.services.clone())
            .ok_or(HalError::NotConnected)
    }

    async fn subscribe(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, HalError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn write(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), HalError> {
        if !*self.status_tx.borrow() {
            return Err(HalError::NotConnected);
        }
        let response = self.ble.handle_write(&self.address, data)?;
        trace!("Simulated write to {}: {}", self.address, protocol::hex(data));
        if let Some(response) = response {
            self.push(response);
        }
        Ok(())
    }

    fn connection_status(&self) -> watch::Receiver<bool> {
        self.status_tx.subscribe()
    }

    async fn disconnect(&self) -> Result<(), HalError> {
        self.close();
        let mut state = self.ble.state.lock();
        let is_current = state
            .links
            .get(&self.address)
            .map(|l| std::ptr::eq(l.as_ref(), self))
            .unwrap_or(false);
        if is_current {
            state.links.remove(&self.address);
        }
        Ok(())
    }
}
