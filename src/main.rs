use anyhow::Context;
use dual_display_link::domain::models::{DeviceEvent, TextPage};
use dual_display_link::domain::settings::SettingsService;
use dual_display_link::infrastructure::bluetooth::simulated::{SimulatedBle, SimulatedPeripheral};
use dual_display_link::infrastructure::logging::init_logger;
use dual_display_link::{DisplayCommand, DisplayResponse, DisplayService};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Work on a copy so the demo never writes hints into the real settings file
    let settings = SettingsService::new()
        .map(|s| s.get().clone())
        .unwrap_or_default();
    let _logging = init_logger(&settings.log_settings).context("Failed to initialize logging")?;
    info!("Starting dual display demo");

    let ble = SimulatedBle::new();
    ble.add_peripheral(SimulatedPeripheral::new("C0:FF:EE:00:00:01", "Even G1_7_L_39A1B2"));
    ble.add_peripheral(
        SimulatedPeripheral::new("C0:FF:EE:00:00:02", "Even G1_7_R_1D7162").with_battery_level(63),
    );

    let settings = Arc::new(Mutex::new(SettingsService::in_memory(settings)));
    let handle = DisplayService::new(Arc::new(ble.clone()), settings).spawn();

    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DeviceEvent::ConnectionState { device_id, state } => {
                    println!("{device_id}: {state:?}")
                }
                DeviceEvent::Battery { side, level, .. } => println!("{side} battery {level}%"),
                DeviceEvent::Gesture { side, kind, .. } => println!("{side} gesture {kind:?}"),
                DeviceEvent::Dashboard { side, status, .. } => {
                    println!("{side} dashboard {status:?}")
                }
            }
        }
    });

    let device = match handle.request(DisplayCommand::Reconnect).await? {
        DisplayResponse::Connected(summary) => summary,
        other => {
            warn!("Reconnect failed: {:?}", other);
            handle.shutdown().await?;
            return Ok(());
        }
    };
    println!(
        "Connected to {} (serial {}) as {}",
        device.name, device.serial, device.id
    );

    let page = TextPage::single("Hello from both sides");
    let sent = handle
        .request(DisplayCommand::SendText {
            id: device.id.clone(),
            page,
        })
        .await?;
    println!("Send text: {:?}", sent);

    ble.notify("C0:FF:EE:00:00:01", &[0x29]);
    ble.notify("C0:FF:EE:00:00:02", &[0x2C, 0x66, 63]);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let stopped = handle
        .request(DisplayCommand::StopDisplaying(device.id.clone()))
        .await?;
    println!("Stop displaying: {:?}", stopped);

    handle.shutdown().await?;
    printer.abort();
    info!("Demo finished");
    Ok(())
}
