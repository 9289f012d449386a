//! Display Service Module
//!
//! The application-facing surface: a serde command set executed against
//! the device registry and the reconnection ladder, plus a broadcast event
//! stream.

use crate::domain::models::{DeviceEvent, DeviceSummary, TextPage};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::error::DeviceError;
use crate::infrastructure::bluetooth::hal::BleHal;
use crate::infrastructure::bluetooth::orchestrator::{ConnectionOrchestrator, TierOutcome};
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DisplayCommand {
    Ping,
    /// Run the reconnection ladder
    Reconnect,
    Scan { window_ms: u64 },
    ListDevices,
    Connect(String),
    Disconnect(String),
    SendText { id: String, page: TextPage },
    StopDisplaying(String),
    Quit,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DisplayResponse {
    Pong,
    Connected(DeviceSummary),
    Devices(Vec<DeviceSummary>),
    /// Whether both sides answered
    Sent(bool),
    Success(String),
    PermissionMissing(String),
    Error(String),
}

impl From<DeviceError> for DisplayResponse {
    fn from(error: DeviceError) -> Self {
        match error.permission() {
            Some(permission) => DisplayResponse::PermissionMissing(permission.to_string()),
            None => DisplayResponse::Error(error.to_string()),
        }
    }
}

/// Main service coordinating all display operations
pub struct DisplayService {
    registry: Arc<DeviceRegistry>,
    orchestrator: ConnectionOrchestrator,
}

impl DisplayService {
    pub fn new(hal: Arc<dyn BleHal>, settings: Arc<Mutex<SettingsService>>) -> Self {
        let ble = settings.lock().get().ble.clone();
        let registry = Arc::new(DeviceRegistry::new(hal.clone(), &ble));
        let orchestrator = ConnectionOrchestrator::new(hal, registry.clone(), settings);
        Self {
            registry,
            orchestrator,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.registry.subscribe()
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.registry.summaries()
    }

    pub async fn connect(&self, id: &str) -> Result<DeviceSummary, DeviceError> {
        let device = self.orchestrator.connect_known(id).await?;
        Ok(device.summary())
    }

    /// Disconnect both sides and forget the device
    pub async fn disconnect(&self, id: &str) -> Result<(), DeviceError> {
        let device = self
            .registry
            .remove(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        device.disconnect().await;
        info!("Disconnected {}", id);
        Ok(())
    }

    pub async fn send_text(&self, id: &str, page: &TextPage) -> bool {
        match self.registry.get(id) {
            Some(device) => device.send_text(page).await,
            None => false,
        }
    }

    pub async fn stop_displaying(&self, id: &str) -> bool {
        match self.registry.get(id) {
            Some(device) => device.stop_displaying().await,
            None => false,
        }
    }

    pub async fn reconnect(&self) -> TierOutcome {
        self.orchestrator.reconnect().await
    }

    pub async fn scan(&self, window: Duration) -> Result<Vec<DeviceSummary>, DeviceError> {
        let devices = self.orchestrator.discover(window).await?;
        Ok(devices.iter().map(|d| d.summary()).collect())
    }

    pub async fn execute(&self, command: DisplayCommand) -> DisplayResponse {
        match command {
            DisplayCommand::Ping => DisplayResponse::Pong,
            DisplayCommand::Reconnect => match self.reconnect().await {
                TierOutcome::Success(device) => DisplayResponse::Connected(device.summary()),
                TierOutcome::NotFound => DisplayResponse::Error("No device found".to_string()),
                TierOutcome::PermissionMissing(p) => DisplayResponse::PermissionMissing(p.to_string()),
            },
            DisplayCommand::Scan { window_ms } => {
                match self.scan(Duration::from_millis(window_ms)).await {
                    Ok(devices) => DisplayResponse::Devices(devices),
                    Err(e) => e.into(),
                }
            }
            DisplayCommand::ListDevices => DisplayResponse::Devices(self.devices()),
            DisplayCommand::Connect(id) => match self.connect(&id).await {
                Ok(summary) => DisplayResponse::Connected(summary),
                Err(e) => e.into(),
            },
            DisplayCommand::Disconnect(id) => match self.disconnect(&id).await {
                Ok(()) => DisplayResponse::Success(format!("Disconnected {id}")),
                Err(e) => e.into(),
            },
            DisplayCommand::SendText { id, page } => {
                DisplayResponse::Sent(self.send_text(&id, &page).await)
            }
            DisplayCommand::StopDisplaying(id) => {
                DisplayResponse::Sent(self.stop_displaying(&id).await)
            }
            DisplayCommand::Quit => {
                for summary in self.devices() {
                    if let Err(e) = self.disconnect(&summary.id).await {
                        error!("Disconnect during shutdown failed: {}", e);
                    }
                }
                DisplayResponse::Success("Quitting".to_string())
            }
        }
    }

    /// Run the command loop on its own task
    pub fn spawn(self) -> DisplayHandle {
        let registry = self.registry.clone();
        let (commands, mut rx) =
            mpsc::channel::<(DisplayCommand, oneshot::Sender<DisplayResponse>)>(32);

        let task = tokio::spawn(async move {
            while let Some((command, reply)) = rx.recv().await {
                info!("Received command: {:?}", command);
                let quit = command == DisplayCommand::Quit;
                let response = self.execute(command).await;
                let _ = reply.send(response);
                if quit {
                    break;
                }
            }
            info!("Display service stopped");
        });

        DisplayHandle {
            commands,
            registry,
            task,
        }
    }
}

/// Client side of a spawned [`DisplayService`]
pub struct DisplayHandle {
    commands: mpsc::Sender<(DisplayCommand, oneshot::Sender<DisplayResponse>)>,
    registry: Arc<DeviceRegistry>,
    task: JoinHandle<()>,
}

impl DisplayHandle {
    /// Send a command and await its response
    pub async fn request(&self, command: DisplayCommand) -> anyhow::Result<DisplayResponse> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send((command, tx))
            .await
            .map_err(|_| anyhow::anyhow!("Display service is not running"))?;
        rx.await.context("Display service dropped the request")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.registry.subscribe()
    }

    /// Disconnect everything and wait for the command loop to end
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request(DisplayCommand::Quit).await?;
        self.task.await.context("Display service task failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;
    use crate::domain::settings::Settings;
    use crate::infrastructure::bluetooth::hal::Permission;
    use crate::infrastructure::bluetooth::simulated::{SimulatedBle, SimulatedPeripheral};

    const ID: &str = "AA:LAA:R";

    fn service(sim: &SimulatedBle) -> DisplayService {
        sim.add_peripheral(SimulatedPeripheral::new("AA:L", "Even G1_7_L_39A1B2"));
        sim.add_peripheral(SimulatedPeripheral::new("AA:R", "Even G1_7_R_1D7162"));
        let settings = Arc::new(Mutex::new(SettingsService::in_memory(Settings::default())));
        DisplayService::new(Arc::new(sim.clone()), settings)
    }

    #[test]
    fn test_command_json_shape() {
        let json = serde_json::to_string(&DisplayCommand::StopDisplaying("ab".into())).unwrap();
        assert_eq!(json, r#"{"StopDisplaying":"ab"}"#);
        let parsed: DisplayCommand = serde_json::from_str(r#""Reconnect""#).unwrap();
        assert_eq!(parsed, DisplayCommand::Reconnect);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let sim = SimulatedBle::new();
        let service = service(&sim);
        assert_eq!(service.execute(DisplayCommand::Ping).await, DisplayResponse::Pong);
        assert!(matches!(
            service.execute(DisplayCommand::Connect("nope".into())).await,
            DisplayResponse::Error(_)
        ));
        assert_eq!(
            service
                .execute(DisplayCommand::StopDisplaying("nope".into()))
                .await,
            DisplayResponse::Sent(false)
        );
    }

    #[tokio::test]
    async fn test_permission_is_reported() {
        let sim = SimulatedBle::new();
        let service = service(&sim);
        sim.set_missing_permissions(vec![Permission::Scan]);
        assert_eq!(
            service.execute(DisplayCommand::Reconnect).await,
            DisplayResponse::PermissionMissing("BLUETOOTH_SCAN".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_loop_end_to_end() {
        let sim = SimulatedBle::new();
        let handle = service(&sim).spawn();
        let mut events = handle.subscribe();

        let summary = match handle.request(DisplayCommand::Reconnect).await.unwrap() {
            DisplayResponse::Connected(summary) => summary,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(summary.id, ID);
        assert_eq!(summary.state, ConnectionState::Connected);

        let page = TextPage::single("Hello");
        assert_eq!(
            handle
                .request(DisplayCommand::SendText {
                    id: ID.into(),
                    page,
                })
                .await
                .unwrap(),
            DisplayResponse::Sent(true)
        );

        loop {
            if let DeviceEvent::ConnectionState { state, .. } = events.recv().await.unwrap() {
                if state == ConnectionState::Connected {
                    break;
                }
            }
        }

        assert!(matches!(
            handle
                .request(DisplayCommand::Disconnect(ID.into()))
                .await
                .unwrap(),
            DisplayResponse::Success(_)
        ));
        assert!(!sim.is_connected("AA:L"));
        assert_eq!(
            handle.request(DisplayCommand::ListDevices).await.unwrap(),
            DisplayResponse::Devices(vec![])
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_then_connect_by_id() {
        let sim = SimulatedBle::new();
        let service = service(&sim);

        let found = service.scan(Duration::from_secs(2)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].state, ConnectionState::Uninitialized);

        let summary = service.connect(ID).await.unwrap();
        assert_eq!(summary.serial, "39A1B21D7162");
        assert!(service.stop_displaying(ID).await);
        service.disconnect(ID).await.unwrap();
    }
}
