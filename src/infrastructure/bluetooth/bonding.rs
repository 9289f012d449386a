//! OS-level bonding ahead of GATT connects.

use crate::infrastructure::bluetooth::error::{BondFailureReason, DeviceError};
use crate::infrastructure::bluetooth::hal::{BleHal, BondState, HalError, ListenerId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bond-state listener registration, released on drop
struct ListenerGuard<'a> {
    hal: &'a dyn BleHal,
    id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.hal.unregister_bond_listener(self.id);
    }
}

pub struct BondingCoordinator {
    hal: Arc<dyn BleHal>,
    timeout: Duration,
}

impl BondingCoordinator {
    pub fn new(hal: Arc<dyn BleHal>, timeout: Duration) -> Self {
        Self { hal, timeout }
    }

    /// Make sure the OS holds a bond for `address`.
    ///
    /// Returns immediately when already bonded. Otherwise starts bonding and
    /// waits for a terminal bond signal; if none arrives in time the bond
    /// state is checked once more before giving up.
    pub async fn ensure_bonded(&self, address: &str) -> Result<(), DeviceError> {
        if self.hal.bond_state(address) == BondState::Bonded {
            debug!("{} already bonded", address);
            return Ok(());
        }

        let (id, mut signals) = self.hal.register_bond_listener(address);
        let _guard = ListenerGuard {
            hal: self.hal.as_ref(),
            id,
        };

        let mode = self
            .hal
            .initiate_bond(address)
            .map_err(|e| initiation_error(address, e))?;
        info!("Bonding with {} started ({:?})", address, mode);

        let terminal = async {
            while let Some(state) = signals.recv().await {
                match state {
                    BondState::Bonding => debug!("{} bonding in progress", address),
                    BondState::Bonded => return Some(true),
                    BondState::None => return Some(false),
                }
            }
            None
        };

        match tokio::time::timeout(self.timeout, terminal).await {
            Ok(Some(true)) => {
                info!("Bonded with {}", address);
                Ok(())
            }
            Ok(Some(false)) => Err(DeviceError::BondFailure {
                address: address.to_string(),
                reason: BondFailureReason::Rejected,
            }),
            Ok(None) | Err(_) => {
                if self.hal.bond_state(address) == BondState::Bonded {
                    info!("Bonded with {} (no signal received)", address);
                    Ok(())
                } else {
                    warn!("Bonding with {} timed out", address);
                    Err(DeviceError::BondFailure {
                        address: address.to_string(),
                        reason: BondFailureReason::Timeout,
                    })
                }
            }
        }
    }

    /// Drop the existing bond and bond again
    pub async fn rebond(&self, address: &str) -> Result<(), DeviceError> {
        info!("Re-bonding with {}", address);
        match self.hal.remove_bond(address) {
            Ok(()) => {}
            Err(HalError::PermissionDenied(permission)) => {
                return Err(DeviceError::PermissionDenied {
                    address: address.to_string(),
                    operation: "remove bond",
                    permission,
                })
            }
            Err(e) => warn!("Removing bond for {} failed: {}", address, e),
        }
        self.ensure_bonded(address).await
    }
}

fn initiation_error(address: &str, error: HalError) -> DeviceError {
    match error {
        HalError::PermissionDenied(permission) => DeviceError::PermissionDenied {
            address: address.to_string(),
            operation: "bond",
            permission,
        },
        other => DeviceError::BondFailure {
            address: address.to_string(),
            reason: BondFailureReason::InitiationFailed(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::hal::Permission;
    use crate::infrastructure::bluetooth::simulated::{
        BondBehavior, SimulatedBle, SimulatedPeripheral,
    };

    const ADDR: &str = "AA:00:00:00:00:01";

    fn setup(peripheral: SimulatedPeripheral) -> (SimulatedBle, BondingCoordinator) {
        let sim = SimulatedBle::new();
        sim.add_peripheral(peripheral);
        let coordinator = BondingCoordinator::new(Arc::new(sim.clone()), Duration::from_secs(20));
        (sim, coordinator)
    }

    fn peripheral(behavior: BondBehavior) -> SimulatedPeripheral {
        SimulatedPeripheral::new(ADDR, "Even G1_7_L_39A1B2").with_bond_behavior(behavior)
    }

    #[tokio::test]
    async fn test_already_bonded_skips_listener() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::Accept).bonded());
        coordinator.ensure_bonded(ADDR).await.unwrap();
        assert_eq!(sim.listener_registrations(), 0);
    }

    #[tokio::test]
    async fn test_success_deregisters_once() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::Accept));
        coordinator.ensure_bonded(ADDR).await.unwrap();
        assert!(sim.is_bonded(ADDR));
        assert_eq!(sim.listener_registrations(), 1);
        assert_eq!(sim.listener_deregistrations(), 1);
        assert_eq!(sim.active_listeners(), 0);
    }

    #[tokio::test]
    async fn test_standard_bond_fallback() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::Accept).without_insecure_bond());
        coordinator.ensure_bonded(ADDR).await.unwrap();
        assert!(sim.is_bonded(ADDR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deregisters_once() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::Hang));
        let err = coordinator.ensure_bonded(ADDR).await.unwrap_err();
        assert_eq!(
            err,
            DeviceError::BondFailure {
                address: ADDR.to_string(),
                reason: BondFailureReason::Timeout,
            }
        );
        assert_eq!(sim.listener_deregistrations(), 1);
        assert_eq!(sim.active_listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rechecks_bond_state() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::CompleteSilently));
        coordinator.ensure_bonded(ADDR).await.unwrap();
        assert_eq!(sim.listener_deregistrations(), 1);
    }

    #[tokio::test]
    async fn test_error_paths_deregister_once() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::Reject));
        let err = coordinator.ensure_bonded(ADDR).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::BondFailure {
                reason: BondFailureReason::Rejected,
                ..
            }
        ));
        assert_eq!(sim.listener_deregistrations(), 1);

        let (sim, coordinator) = setup(peripheral(BondBehavior::RefuseToStart));
        let err = coordinator.ensure_bonded(ADDR).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::BondFailure {
                reason: BondFailureReason::InitiationFailed(_),
                ..
            }
        ));
        assert_eq!(sim.listener_deregistrations(), 1);

        let (sim, coordinator) = setup(peripheral(BondBehavior::Accept));
        sim.set_missing_permissions(vec![Permission::Connect]);
        let err = coordinator.ensure_bonded(ADDR).await.unwrap_err();
        assert_eq!(err.permission(), Some(Permission::Connect));
        assert_eq!(sim.listener_registrations(), 1);
        assert_eq!(sim.listener_deregistrations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_deregisters() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::Hang));
        let outcome =
            tokio::time::timeout(Duration::from_secs(1), coordinator.ensure_bonded(ADDR)).await;
        assert!(outcome.is_err());
        assert_eq!(sim.listener_deregistrations(), 1);
    }

    #[tokio::test]
    async fn test_rebond_removes_first() {
        let (sim, coordinator) = setup(peripheral(BondBehavior::Accept).bonded());
        coordinator.rebond(ADDR).await.unwrap();
        assert_eq!(sim.bond_removals(), vec![ADDR.to_string()]);
        assert!(sim.is_bonded(ADDR));
        assert_eq!(sim.listener_registrations(), 1);
    }
}
