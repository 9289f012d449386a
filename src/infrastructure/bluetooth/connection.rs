//! BLE Connection Module
//!
//! Owns the lifecycle of one peripheral link: GATT connect, MTU, service
//! discovery, notification subscription and writes.

use crate::domain::models::ConnectionState;
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::error::{DeviceError, GattFailure};
use crate::infrastructure::bluetooth::hal::{BleHal, GattConnection, ServiceInfo};
use crate::infrastructure::bluetooth::protocol::{
    self, IncomingPacket, OutgoingPacket, Packet, DFU_SERVICE_UUID, NOTIFY_CHAR_UUID, SERVICE_UUID,
    SMP_SERVICE_UUID, WRITE_CHAR_UUID,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const SUBSCRIBE_ATTEMPTS: u32 = 3;
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// MTU requested after connecting
    pub mtu: u16,
    /// Upper bound for the GATT connect itself
    pub connect_timeout: Duration,
    /// Attempts per write before reporting failure
    pub write_attempts: u32,
    pub auto_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from(&BleSettings::default())
    }
}

impl From<&BleSettings> for LinkConfig {
    fn from(settings: &BleSettings) -> Self {
        Self {
            mtu: settings.mtu,
            connect_timeout: settings.connect_timeout(),
            write_attempts: settings.write_attempts.max(1),
            auto_connect: false,
        }
    }
}

/// `true` when the display service exposes a writable command
/// characteristic and a notifying event characteristic
pub fn is_required_service_supported(services: &[ServiceInfo]) -> bool {
    let Some(service) = services.iter().find(|s| s.uuid == SERVICE_UUID) else {
        return false;
    };

    let writable = service
        .characteristics
        .iter()
        .any(|c| c.uuid == WRITE_CHAR_UUID && c.properties.can_write());
    let notifying = service
        .characteristics
        .iter()
        .any(|c| c.uuid == NOTIFY_CHAR_UUID && c.properties.can_notify());

    writable && notifying
}

fn log_diagnostic_services(address: &str, services: &[ServiceInfo]) {
    for (uuid, label) in [(SMP_SERVICE_UUID, "SMP"), (DFU_SERVICE_UUID, "DFU")] {
        if services.iter().any(|s| s.uuid == uuid) {
            debug!("{} exposes the {} service", address, label);
        }
    }
}

/// A GATT connection that is still being set up. Dropped while armed, it
/// closes the platform link and marks the peripheral disconnected.
struct PendingConnection {
    connection: Arc<dyn GattConnection>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    armed: bool,
}

impl PendingConnection {
    fn new(
        connection: Arc<dyn GattConnection>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        Self {
            connection,
            state_tx,
            armed: true,
        }
    }

    fn connection(&self) -> &dyn GattConnection {
        self.connection.as_ref()
    }

    fn disarm(mut self) -> Arc<dyn GattConnection> {
        self.armed = false;
        self.connection.clone()
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let connection = self.connection.clone();
        warn!("Connect to {} was abandoned, closing the link", connection.address());
        self.state_tx.send_replace(ConnectionState::Disconnected);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connection.disconnect().await {
                        warn!("Closing {} reported: {}", connection.address(), e);
                    }
                });
            }
            Err(_) => error!(
                "No runtime left to close {}; the link stays open",
                connection.address()
            ),
        }
    }
}

/// One peripheral link
pub struct PeripheralLink {
    hal: Arc<dyn BleHal>,
    address: String,
    config: LinkConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    packet_tx: mpsc::UnboundedSender<IncomingPacket>,
    packet_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingPacket>>>,
    connection: Arc<Mutex<Option<Arc<dyn GattConnection>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeripheralLink {
    pub fn new(hal: Arc<dyn BleHal>, address: impl Into<String>, config: LinkConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        Self {
            hal,
            address: address.into(),
            config,
            state_tx: Arc::new(state_tx),
            packet_tx,
            packet_rx: Mutex::new(Some(packet_rx)),
            connection: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The decoded packet stream. It survives reconnects and can be taken once.
    pub fn take_packets(&self) -> Option<mpsc::UnboundedReceiver<IncomingPacket>> {
        self.packet_rx.lock().take()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("{}: {:?} -> {:?}", self.address, previous, state);
        }
    }

    /// Connect, discover and subscribe. Leaves the link in `Error` on failure.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        info!("Connecting to {}", self.address);
        self.set_state(ConnectionState::Connecting);

        match self.establish().await {
            Ok((connection, notifications)) => {
                self.spawn_workers(connection.clone(), notifications);
                *self.connection.lock() = Some(connection);
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.address);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", self.address, e);
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
    ) -> Result<(Arc<dyn GattConnection>, mpsc::UnboundedReceiver<Vec<u8>>), DeviceError> {
        // Step 1: GATT connect
        let connection = match tokio::time::timeout(
            self.config.connect_timeout,
            self.hal.connect(&self.address, self.config.auto_connect),
        )
        .await
        {
            Ok(result) => {
                result.map_err(|e| DeviceError::from_hal(&self.address, "connect", e))?
            }
            Err(_) => {
                return Err(DeviceError::gatt(
                    &self.address,
                    "connect",
                    GattFailure::ConnectTimeout,
                ))
            }
        };

        // Closed on drop until fully set up
        let pending = PendingConnection::new(connection, self.state_tx.clone());
        match self.prepare(pending.connection()).await {
            Ok(notifications) => Ok((pending.disarm(), notifications)),
            Err(e) => {
                let connection = pending.disarm();
                if let Err(close_err) = connection.disconnect().await {
                    warn!("Closing {} after failure: {}", self.address, close_err);
                }
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        connection: &dyn GattConnection,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, DeviceError> {
        // Step 2: MTU, keeping the default on failure
        match connection.request_mtu(self.config.mtu).await {
            Ok(mtu) => info!("{} negotiated MTU {}", self.address, mtu),
            Err(e) => warn!("MTU request on {} failed, keeping default: {}", self.address, e),
        }

        // Step 3: services
        let services = connection
            .discover_services()
            .await
            .map_err(|e| DeviceError::from_hal(&self.address, "discover services", e))?;
        info!("{} exposes {} services", self.address, services.len());

        if !is_required_service_supported(&services) {
            return Err(DeviceError::gatt(
                &self.address,
                "discover services",
                GattFailure::RequiredServiceUnsupported,
            ));
        }
        log_diagnostic_services(&self.address, &services);

        // Step 4: notifications
        self.subscribe_with_retry(connection).await
    }

    async fn subscribe_with_retry(
        &self,
        connection: &dyn GattConnection,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, DeviceError> {
        for attempt in 1..=SUBSCRIBE_ATTEMPTS {
            match connection.subscribe(SERVICE_UUID, NOTIFY_CHAR_UUID).await {
                Ok(rx) => {
                    info!("Notifications enabled on {}", self.address);
                    return Ok(rx);
                }
                Err(e) => {
                    warn!(
                        "Notification subscription attempt {} on {} failed: {}",
                        attempt, self.address, e
                    );
                    if attempt < SUBSCRIBE_ATTEMPTS {
                        tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(DeviceError::gatt(
            &self.address,
            "subscribe",
            GattFailure::NotificationSetup,
        ))
    }

    /// Decode off the platform callback and watch for remote disconnects
    fn spawn_workers(
        &self,
        connection: Arc<dyn GattConnection>,
        mut notifications: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let packet_tx = self.packet_tx.clone();
        let address = self.address.clone();
        let decoder = tokio::spawn(async move {
            while let Some(bytes) = notifications.recv().await {
                if let Some(packet) = protocol::decode(&bytes) {
                    trace!("{} {}", address, Packet::Incoming(packet.clone()));
                    if packet_tx.send(packet).is_err() {
                        break;
                    }
                }
            }
        });

        let mut status = connection.connection_status();
        let state_tx = self.state_tx.clone();
        let slot = self.connection.clone();
        let address = self.address.clone();
        let watcher = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                if *status.borrow_and_update() {
                    continue;
                }
                if *state_tx.borrow() == ConnectionState::Connected {
                    warn!("{} dropped the connection", address);
                    slot.lock().take();
                    state_tx.send_replace(ConnectionState::Disconnected);
                }
                break;
            }
        });

        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.push(decoder);
        tasks.push(watcher);
    }

    fn abort_workers(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        self.abort_workers();

        let Some(connection) = connection else {
            if self.state() != ConnectionState::Uninitialized {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        };

        info!("Disconnecting from {}", self.address);
        self.set_state(ConnectionState::Disconnecting);
        if let Err(e) = connection.disconnect().await {
            warn!("Disconnect from {} reported: {}", self.address, e);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Write a command, retrying up to the configured attempt count
    pub async fn send(&self, packet: &OutgoingPacket) -> bool {
        let connection = self.connection.lock().clone();
        let Some(connection) = connection else {
            warn!(
                "Cannot send {:?} to {}: not connected",
                packet.packet_type(),
                self.address
            );
            return false;
        };

        let attempts = self.config.write_attempts;
        for attempt in 1..=attempts {
            match connection
                .write(SERVICE_UUID, WRITE_CHAR_UUID, packet.as_bytes())
                .await
            {
                Ok(()) => {
                    trace!("{} {}", self.address, Packet::Outgoing(packet.clone()));
                    return true;
                }
                Err(e) => warn!(
                    "Write of {:?} to {} failed (attempt {}/{}): {}",
                    packet.packet_type(),
                    self.address,
                    attempt,
                    attempts,
                    e
                ),
            }
        }

        error!(
            "Giving up on {:?} to {} after {} attempts",
            packet.packet_type(),
            self.address,
            attempts
        );
        false
    }
}

impl Drop for PeripheralLink {
    fn drop(&mut self) {
        self.abort_workers();
    }
}
