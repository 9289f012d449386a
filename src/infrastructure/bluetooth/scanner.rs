//! BLE Scanner Module
//!
//! Runs bounded scan windows and feeds matching advertisements into a
//! [`PairingTracker`].

use crate::domain::settings::{BleSettings, BondHints};
use crate::infrastructure::bluetooth::composite::{DiscoveredPair, PairingTracker};
use crate::infrastructure::bluetooth::hal::{Advertisement, BleHal, HalError, ScanFilter};
use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Why an advertisement was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    ServiceUuid,
    ManufacturerData(u16),
    NameKeyword,
}

/// What makes an advertisement one of ours
#[derive(Debug, Clone)]
pub struct ScanCriteria {
    pub name_keyword: String,
    pub service_uuid: Uuid,
    /// Company ids learned from earlier successful connections
    pub manufacturer_ids: Vec<u16>,
}

impl ScanCriteria {
    pub fn new(settings: &BleSettings, hints: &BondHints) -> Self {
        Self {
            name_keyword: settings.name_keyword.clone(),
            service_uuid: SERVICE_UUID,
            manufacturer_ids: hints.manufacturer_ids.clone(),
        }
    }

    /// Strongest evidence first
    pub fn matches(&self, adv: &Advertisement) -> Option<MatchReason> {
        if adv.service_uuids.contains(&self.service_uuid) {
            return Some(MatchReason::ServiceUuid);
        }
        if let Some(id) = self
            .manufacturer_ids
            .iter()
            .find(|id| adv.manufacturer_data.contains_key(id))
        {
            return Some(MatchReason::ManufacturerData(*id));
        }
        let keyword = self.name_keyword.to_lowercase();
        match &adv.name {
            Some(name) if !keyword.is_empty() && name.to_lowercase().contains(&keyword) => {
                Some(MatchReason::NameKeyword)
            }
            _ => None,
        }
    }
}

/// Stops the running scan when dropped
struct ScanGuard<'a> {
    hal: &'a dyn BleHal,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        debug!("Stopping BLE scan");
        self.hal.stop_scan();
    }
}

/// BLE Scanner for discovering left/right display pairs
pub struct BleScanner {
    hal: Arc<dyn BleHal>,
}

impl BleScanner {
    pub fn new(hal: Arc<dyn BleHal>) -> Self {
        Self { hal }
    }

    /// Scan until the first complete pair or until `window` elapses
    pub async fn scan_for_pair(
        &self,
        filter: &ScanFilter,
        criteria: &ScanCriteria,
        window: Duration,
    ) -> Result<Option<DiscoveredPair>, HalError> {
        info!("Scanning for a display pair ({:?}, {:?})", filter, window);
        let mut advertisements = self.hal.start_scan(filter)?;
        let _guard = ScanGuard {
            hal: self.hal.as_ref(),
        };

        let deadline = Instant::now() + window;
        let mut tracker = PairingTracker::new();
        while let Ok(Some(adv)) = tokio::time::timeout_at(deadline, advertisements.recv()).await {
            if criteria.matches(&adv).is_none() {
                trace!("Ignoring {} ({:?})", adv.address, adv.name);
                continue;
            }
            if let Some(pair) = tracker.observe(adv) {
                info!("Found pair {} ({})", pair.name(), pair.id());
                return Ok(Some(pair));
            }
        }

        debug!(
            "Scan window closed, saw {} devices",
            tracker.seen_addresses().len()
        );
        Ok(None)
    }

    /// Collect every complete pair seen during the full window
    pub async fn discover(
        &self,
        filter: &ScanFilter,
        criteria: &ScanCriteria,
        window: Duration,
    ) -> Result<Vec<DiscoveredPair>, HalError> {
        let mut advertisements = self.hal.start_scan(filter)?;
        let _guard = ScanGuard {
            hal: self.hal.as_ref(),
        };

        let deadline = Instant::now() + window;
        let mut tracker = PairingTracker::new();
        let mut pairs: Vec<DiscoveredPair> = Vec::new();
        while let Ok(Some(adv)) = tokio::time::timeout_at(deadline, advertisements.recv()).await {
            if criteria.matches(&adv).is_none() {
                continue;
            }
            if let Some(pair) = tracker.observe(adv) {
                if !pairs.iter().any(|p| p.id() == pair.id()) {
                    pairs.push(pair);
                }
            }
        }

        info!("Discovered {} pairs", pairs.len());
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::hal::Permission;
    use crate::infrastructure::bluetooth::simulated::{SimulatedBle, SimulatedPeripheral};

    fn criteria() -> ScanCriteria {
        ScanCriteria::new(&BleSettings::default(), &BondHints::default())
    }

    fn sim_with(peripherals: Vec<SimulatedPeripheral>) -> (SimulatedBle, BleScanner) {
        let sim = SimulatedBle::new();
        for p in peripherals {
            sim.add_peripheral(p);
        }
        let scanner = BleScanner::new(Arc::new(sim.clone()));
        (sim, scanner)
    }

    #[test]
    fn test_match_reasons() {
        let mut criteria = criteria();
        criteria.manufacturer_ids = vec![0x0059];

        let mut adv = Advertisement::named("01", "Headphones");
        assert_eq!(criteria.matches(&adv), None);

        adv.name = Some("even g1_7_L_x".into());
        assert_eq!(criteria.matches(&adv), Some(MatchReason::NameKeyword));

        adv.manufacturer_data.insert(0x0059, vec![1, 2]);
        assert_eq!(criteria.matches(&adv), Some(MatchReason::ManufacturerData(0x0059)));

        adv.service_uuids.push(SERVICE_UUID);
        assert_eq!(criteria.matches(&adv), Some(MatchReason::ServiceUuid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pair_stops_scan() {
        let (sim, scanner) = sim_with(vec![
            SimulatedPeripheral::new("01", "Even G1_7_L_39A1B2"),
            SimulatedPeripheral::new("02", "Speaker_1_L_x").advertising_services(vec![]),
            SimulatedPeripheral::new("03", "Even G1_7_R_1D7162"),
            SimulatedPeripheral::new("04", "Even G1_9_L_AAAAAA"),
            SimulatedPeripheral::new("05", "Even G1_9_R_BBBBBB"),
        ]);

        let pair = scanner
            .scan_for_pair(&ScanFilter::Unfiltered, &criteria(), Duration::from_secs(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pair.id(), "0103");
        assert_eq!(sim.scan_starts(), 1);
        assert_eq!(sim.scan_stops(), 1);
        assert!(!sim.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapses_without_match() {
        let (sim, scanner) = sim_with(vec![
            SimulatedPeripheral::new("01", "Even G1_7_L_39A1B2"),
            SimulatedPeripheral::new("02", "Speaker_1_R_x").advertising_services(vec![]),
        ]);

        let started = Instant::now();
        let found = scanner
            .scan_for_pair(&ScanFilter::Unfiltered, &criteria(), Duration::from_secs(7))
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(sim.scan_stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_advertisement_completes_pair() {
        let (sim, scanner) = sim_with(vec![SimulatedPeripheral::new("01", "Even G1_7_L_39A1B2")]);
        let late = SimulatedPeripheral::new("02", "Even G1_7_R_1D7162").advertisement();

        let feeder = {
            let sim = sim.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                sim.advertise(late)
            })
        };
        let pair = scanner
            .scan_for_pair(&ScanFilter::Unfiltered, &criteria(), Duration::from_secs(7))
            .await
            .unwrap();
        assert!(feeder.await.unwrap());
        assert_eq!(pair.map(|p| p.id()), Some("0102".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_scan_is_stopped() {
        let (sim, scanner) = sim_with(vec![]);
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            scanner.scan_for_pair(&ScanFilter::Unfiltered, &criteria(), Duration::from_secs(7)),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(sim.scan_stops(), 1);
        assert!(!sim.is_scanning());
    }

    #[tokio::test]
    async fn test_missing_permission_never_starts() {
        let (sim, scanner) = sim_with(vec![]);
        sim.set_missing_permissions(vec![Permission::Scan]);
        let err = scanner
            .scan_for_pair(&ScanFilter::Unfiltered, &criteria(), Duration::from_secs(7))
            .await
            .unwrap_err();
        assert_eq!(err, HalError::PermissionDenied(Permission::Scan));
        assert_eq!(sim.scan_starts(), 0);
        assert_eq!(sim.scan_stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_lists_every_pair() {
        let (sim, scanner) = sim_with(vec![
            SimulatedPeripheral::new("01", "Even G1_7_L_39A1B2"),
            SimulatedPeripheral::new("02", "Even G1_7_R_1D7162"),
            SimulatedPeripheral::new("03", "Even G1_9_L_AAAAAA"),
            SimulatedPeripheral::new("04", "Even G1_9_R_BBBBBB"),
        ]);

        let pairs = scanner
            .discover(
                &ScanFilter::Services(vec![SERVICE_UUID]),
                &criteria(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let ids: Vec<String> = pairs.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["0102", "0304"]);
        assert_eq!(sim.scan_stops(), 1);
    }
}
