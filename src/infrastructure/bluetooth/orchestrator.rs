//! Reconnection Ladder
//!
//! Reuse an open device, then reconnect bonded peripherals, then fall back
//! to scanning. A missing permission ends the ladder immediately.

use crate::domain::settings::{BleSettings, BondHints, SettingsService};
use crate::infrastructure::bluetooth::composite::{CompositeDevice, DiscoveredPair, PairingTracker};
use crate::infrastructure::bluetooth::error::DeviceError;
use crate::infrastructure::bluetooth::hal::{Advertisement, BleHal, HalError, Permission, ScanFilter};
use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::scanner::{BleScanner, MatchReason, ScanCriteria};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderTier {
    Reuse,
    Bonded,
    Scan,
}

pub enum TierOutcome {
    Success(Arc<CompositeDevice>),
    NotFound,
    PermissionMissing(Permission),
}

impl fmt::Debug for TierOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierOutcome::Success(device) => write!(f, "Success({})", device.id()),
            TierOutcome::NotFound => write!(f, "NotFound"),
            TierOutcome::PermissionMissing(p) => write!(f, "PermissionMissing({})", p),
        }
    }
}

impl From<DeviceError> for TierOutcome {
    fn from(error: DeviceError) -> Self {
        match error.permission() {
            Some(permission) => TierOutcome::PermissionMissing(permission),
            None => TierOutcome::NotFound,
        }
    }
}

pub struct ConnectionOrchestrator {
    hal: Arc<dyn BleHal>,
    registry: Arc<DeviceRegistry>,
    settings: Arc<Mutex<SettingsService>>,
    scanner: BleScanner,
}

impl ConnectionOrchestrator {
    pub fn new(
        hal: Arc<dyn BleHal>,
        registry: Arc<DeviceRegistry>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        Self {
            scanner: BleScanner::new(hal.clone()),
            hal,
            registry,
            settings,
        }
    }

    fn snapshot(&self) -> (BleSettings, BondHints) {
        let settings = self.settings.lock();
        let s = settings.get();
        (s.ble.clone(), s.bond_hints.clone())
    }

    /// Run the whole ladder within the configured budget
    pub async fn reconnect(&self) -> TierOutcome {
        let budget = self.snapshot().0.ladder_budget();
        match tokio::time::timeout(budget, self.run_ladder()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Reconnection gave up after {:?}", budget);
                TierOutcome::NotFound
            }
        }
    }

    async fn run_ladder(&self) -> TierOutcome {
        for tier in [LadderTier::Reuse, LadderTier::Bonded, LadderTier::Scan] {
            let outcome = match tier {
                LadderTier::Reuse => self.reuse(),
                LadderTier::Bonded => self.bonded_reconnect().await,
                LadderTier::Scan => self.scan_fallback().await,
            };
            match outcome {
                TierOutcome::NotFound => debug!("{:?} tier found nothing", tier),
                outcome => {
                    info!("{:?} tier finished: {:?}", tier, outcome);
                    return outcome;
                }
            }
        }
        TierOutcome::NotFound
    }

    fn reuse(&self) -> TierOutcome {
        match self.registry.connected() {
            Some(device) => TierOutcome::Success(device),
            None => TierOutcome::NotFound,
        }
    }

    async fn bonded_reconnect(&self) -> TierOutcome {
        let bonded = match self.hal.bonded_devices() {
            Ok(devices) => devices,
            Err(HalError::PermissionDenied(p)) => return TierOutcome::PermissionMissing(p),
            Err(e) => {
                warn!("Could not list bonded devices: {}", e);
                return TierOutcome::NotFound;
            }
        };

        let (settings, hints) = self.snapshot();
        let criteria = ScanCriteria::new(&settings, &hints);
        let mut tracker = PairingTracker::new();
        let mut pairs: Vec<DiscoveredPair> = bonded
            .iter()
            .map(Advertisement::from)
            .filter(|adv| criteria.matches(adv).is_some() || hints.is_known(&adv.address))
            .filter_map(|adv| tracker.observe(adv))
            .collect();

        if let Some(last) = &hints.last_successful_address {
            pairs.sort_by_key(|p| p.left.address != *last && p.right.address != *last);
        }
        debug!("{} bonded pair candidates", pairs.len());

        for pair in &pairs {
            match self.try_connect(pair, &criteria).await {
                TierOutcome::NotFound => continue,
                outcome => return outcome,
            }
        }
        TierOutcome::NotFound
    }

    async fn scan_fallback(&self) -> TierOutcome {
        if let Some(permission) = self.hal.missing_permissions().first() {
            return TierOutcome::PermissionMissing(*permission);
        }

        let (settings, hints) = self.snapshot();
        let criteria = ScanCriteria::new(&settings, &hints);
        let windows = [
            (ScanFilter::Unfiltered, settings.broad_scan_window()),
            (
                ScanFilter::Services(vec![SERVICE_UUID]),
                settings.filtered_scan_window(),
            ),
        ];

        for (filter, window) in windows {
            match self.scanner.scan_for_pair(&filter, &criteria, window).await {
                Ok(Some(pair)) => return self.try_connect(&pair, &criteria).await,
                Ok(None) => {}
                Err(HalError::PermissionDenied(p)) => return TierOutcome::PermissionMissing(p),
                Err(e) => warn!("Scan failed: {}", e),
            }
        }
        TierOutcome::NotFound
    }

    async fn try_connect(&self, pair: &DiscoveredPair, criteria: &ScanCriteria) -> TierOutcome {
        let device = self.registry.get_or_create(pair);
        match device.connect().await {
            Ok(()) => {
                self.record_success(pair, criteria).await;
                TierOutcome::Success(device)
            }
            Err(e) => {
                warn!("Could not connect {}: {}", pair.id(), e);
                e.into()
            }
        }
    }

    async fn record_success(&self, pair: &DiscoveredPair, criteria: &ScanCriteria) {
        let pending = {
            let mut settings = self.settings.lock();
            for adv in [&pair.left, &pair.right] {
                let reason = criteria.matches(adv);
                let manufacturer_id = match reason {
                    Some(MatchReason::ManufacturerData(id)) => Some(id),
                    _ => None,
                };
                settings.record_successful_connection(
                    &adv.address,
                    reason == Some(MatchReason::ServiceUuid),
                    manufacturer_id,
                );
            }
            settings.pending_save()
        };

        let Some(pending) = pending else {
            return;
        };
        match tokio::task::spawn_blocking(move || pending.write()).await {
            Ok(Ok(())) => debug!("Saved bond hints for {}", pair.id()),
            Ok(Err(e)) => warn!("Could not persist bond hints for {}: {}", pair.id(), e),
            Err(e) => warn!("Settings writer for {} failed: {}", pair.id(), e),
        }
    }

    /// Connect a device already in the registry
    pub async fn connect_known(&self, id: &str) -> Result<Arc<CompositeDevice>, DeviceError> {
        let device = self
            .registry
            .get(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        device.connect().await?;

        let (settings, hints) = self.snapshot();
        let criteria = ScanCriteria::new(&settings, &hints);
        self.record_success(device.pair(), &criteria).await;
        Ok(device)
    }

    /// List the pairs visible during `window` and register them
    pub async fn discover(&self, window: Duration) -> Result<Vec<Arc<CompositeDevice>>, DeviceError> {
        let (settings, hints) = self.snapshot();
        let criteria = ScanCriteria::new(&settings, &hints);
        let pairs = self
            .scanner
            .discover(&ScanFilter::Unfiltered, &criteria, window)
            .await
            .map_err(|e| DeviceError::from_hal("*", "scan", e))?;
        Ok(pairs.iter().map(|p| self.registry.get_or_create(p)).collect())
    }
}
