//! Logical devices known to this process, keyed by composite id.

use crate::domain::models::{DeviceEvent, DeviceSummary};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::bonding::BondingCoordinator;
use crate::infrastructure::bluetooth::composite::{CompositeDevice, DiscoveredPair};
use crate::infrastructure::bluetooth::hal::BleHal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

pub struct DeviceRegistry {
    hal: Arc<dyn BleHal>,
    bonding: Arc<BondingCoordinator>,
    settings: BleSettings,
    devices: Mutex<HashMap<String, Arc<CompositeDevice>>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceRegistry {
    pub fn new(hal: Arc<dyn BleHal>, settings: &BleSettings) -> Self {
        let bonding = Arc::new(BondingCoordinator::new(hal.clone(), settings.bond_timeout()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            hal,
            bonding,
            settings: settings.clone(),
            devices: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// The device for `pair`, created on first sight
    pub fn get_or_create(&self, pair: &DiscoveredPair) -> Arc<CompositeDevice> {
        let mut devices = self.devices.lock();
        devices
            .entry(pair.id())
            .or_insert_with(|| {
                debug!("Registering {} ({})", pair.name(), pair.id());
                Arc::new(CompositeDevice::new(
                    pair,
                    self.hal.clone(),
                    self.bonding.clone(),
                    &self.settings,
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<CompositeDevice>> {
        self.devices.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<CompositeDevice>> {
        self.devices.lock().remove(id)
    }

    /// Any device whose both sides are up
    pub fn connected(&self) -> Option<Arc<CompositeDevice>> {
        self.devices
            .lock()
            .values()
            .find(|d| d.is_connected())
            .cloned()
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        let mut summaries: Vec<DeviceSummary> =
            self.devices.lock().values().map(|d| d.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
