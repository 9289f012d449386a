//! Composite Device
//!
//! A left and a right peripheral discovered together act as one logical
//! device. This module pairs advertisements by name, composes the two
//! connection states and fans commands out to both sides.

use crate::domain::models::{ConnectionState, DeviceEvent, DeviceSummary, Side, TextPage};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::bonding::BondingCoordinator;
use crate::infrastructure::bluetooth::error::DeviceError;
use crate::infrastructure::bluetooth::hal::{Advertisement, BleHal};
use crate::infrastructure::bluetooth::protocol::{IncomingPacket, IncomingPayload, OutgoingPacket};
use crate::infrastructure::bluetooth::session::DeviceSession;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Derive the logical state from the two side states. Argument order does
/// not matter.
pub fn compose_states(a: ConnectionState, b: ConnectionState) -> ConnectionState {
    use ConnectionState::*;

    match (a, b) {
        (Connected, Connected) => Connected,
        (Disconnecting, _) | (_, Disconnecting) => Disconnecting,
        // One side dropped: tear the other one down too
        (Disconnected, Connected) | (Connected, Disconnected) => Disconnecting,
        (Connecting, _) | (_, Connecting) => Connecting,
        (Disconnected, Disconnected) => Disconnected,
        (Error, _) | (_, Error) => Error,
        _ => Uninitialized,
    }
}

/// Exactly one side is still up after the other went away
fn is_one_sided_drop(left: ConnectionState, right: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!((left, right), (Disconnected, Connected) | (Connected, Disconnected))
}

async fn tear_down(left: &DeviceSession, right: &DeviceSession) {
    tokio::join!(left.disconnect(), right.disconnect());
}

/// Disconnects both sides if a connect is dropped before it finishes
struct ConnectAttempt {
    left: Arc<DeviceSession>,
    right: Arc<DeviceSession>,
    armed: bool,
}

impl ConnectAttempt {
    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!(
            "Connect to {} + {} was abandoned, tearing both sides down",
            self.left.address(),
            self.right.address()
        );
        let (left, right) = (self.left.clone(), self.right.clone());
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { tear_down(&left, &right).await });
        }
    }
}

/// Pairing key and side parsed from `<Brand>_<pairId>_<L|R>_<suffix>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub key: String,
    pub side: Side,
}

/// Six upper-case alphanumerics, e.g. `39A1B2`. These differ between the two
/// sides of one pair and are left out of the key.
fn is_hardware_id(token: &str) -> bool {
    token.len() == 6
        && token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

pub fn parse_name(name: &str) -> Option<ParsedName> {
    let tokens: Vec<&str> = name.split('_').collect();
    if tokens.len() < 3 || tokens[0].is_empty() || tokens[1].is_empty() {
        return None;
    }

    let side = match tokens[2] {
        "L" | "l" => Side::Left,
        "R" | "r" => Side::Right,
        _ => return None,
    };

    let mut key = format!("{}_{}", tokens[0], tokens[1]).to_lowercase();
    let suffix = tokens[3..].join("_");
    if !suffix.is_empty() && !is_hardware_id(&suffix) {
        key.push('_');
        key.push_str(&suffix.to_lowercase());
    }

    Some(ParsedName { key, side })
}

/// A completed left/right match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPair {
    pub key: String,
    pub left: Advertisement,
    pub right: Advertisement,
}

impl DiscoveredPair {
    /// Left MAC followed by right MAC
    pub fn id(&self) -> String {
        format!("{}{}", self.left.address, self.right.address)
    }

    /// First two name tokens of the left side
    pub fn name(&self) -> String {
        let left = self.left.name.as_deref().unwrap_or_default();
        left.split('_').take(2).collect::<Vec<_>>().join("_")
    }

    /// Fourth name token of each side
    pub fn serial(&self) -> String {
        let token = |adv: &Advertisement| {
            adv.name
                .as_deref()
                .and_then(|n| n.split('_').nth(3))
                .unwrap_or_default()
                .to_string()
        };
        format!("{}{}", token(&self.left), token(&self.right))
    }
}

#[derive(Debug, Default)]
struct PartialPair {
    left: Option<Advertisement>,
    right: Option<Advertisement>,
}

/// Groups advertisements into left/right pairs
#[derive(Debug, Default)]
pub struct PairingTracker {
    pending: HashMap<String, PartialPair>,
    seen: Vec<String>,
}

impl PairingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. Returns the pair it completes, once.
    pub fn observe(&mut self, adv: Advertisement) -> Option<DiscoveredPair> {
        if !self.seen.contains(&adv.address) {
            self.seen.push(adv.address.clone());
        }

        let parsed = parse_name(adv.name.as_deref()?)?;
        let entry = self.pending.entry(parsed.key.clone()).or_default();
        match parsed.side {
            Side::Left => entry.left = Some(adv),
            Side::Right => entry.right = Some(adv),
        }
        if entry.left.is_none() || entry.right.is_none() {
            return None;
        }

        let partial = self.pending.remove(&parsed.key)?;
        let pair = DiscoveredPair {
            key: parsed.key,
            left: partial.left?,
            right: partial.right?,
        };
        debug!("Matched pair {} ({})", pair.key, pair.id());
        Some(pair)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Addresses in first-seen order
    pub fn seen_addresses(&self) -> &[String] {
        &self.seen
    }
}

fn to_event(device_id: &str, side: Side, packet: &IncomingPacket) -> Option<DeviceEvent> {
    match packet.payload() {
        IncomingPayload::Gesture { kind, timestamp } => Some(DeviceEvent::Gesture {
            device_id: device_id.to_string(),
            side,
            kind: *kind,
            timestamp: *timestamp,
        }),
        IncomingPayload::Dashboard(status) => Some(DeviceEvent::Dashboard {
            device_id: device_id.to_string(),
            side,
            status: *status,
        }),
        _ => None,
    }
}

/// The logical device
pub struct CompositeDevice {
    pair: DiscoveredPair,
    id: String,
    name: String,
    serial: String,
    left: Arc<DeviceSession>,
    right: Arc<DeviceSession>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<DeviceEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CompositeDevice {
    pub fn new(
        pair: &DiscoveredPair,
        hal: Arc<dyn BleHal>,
        bonding: Arc<BondingCoordinator>,
        settings: &BleSettings,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        let left = DeviceSession::new(
            hal.clone(),
            bonding.clone(),
            &pair.left.address,
            Side::Left,
            settings,
        );
        let right = DeviceSession::new(hal, bonding, &pair.right.address, Side::Right, settings);
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);

        Self {
            pair: pair.clone(),
            id: pair.id(),
            name: pair.name(),
            serial: pair.serial(),
            left: Arc::new(left),
            right: Arc::new(right),
            state_tx: Arc::new(state_tx),
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The advertisements this device was created from
    pub fn pair(&self) -> &DiscoveredPair {
        &self.pair
    }

    pub fn left(&self) -> &DeviceSession {
        &self.left
    }

    pub fn right(&self) -> &DeviceSession {
        &self.right
    }

    pub fn state(&self) -> ConnectionState {
        compose_states(self.left.state(), self.right.state())
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            serial: self.serial.clone(),
            left_address: self.left.address().to_string(),
            right_address: self.right.address().to_string(),
            state: self.state(),
        }
    }

    /// Start the state composer and the per-side event forwarders
    fn ensure_watchers(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(self.spawn_composer());
        for session in [&self.left, &self.right] {
            tasks.push(self.spawn_packet_forwarder(session));
            tasks.push(self.spawn_battery_forwarder(session));
        }
    }

    fn spawn_composer(&self) -> JoinHandle<()> {
        let mut left = self.left.state_changes();
        let mut right = self.right.state_changes();
        let sessions = (self.left.clone(), self.right.clone());
        let state_tx = self.state_tx.clone();
        let events = self.events.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            loop {
                let l = *left.borrow_and_update();
                let r = *right.borrow_and_update();
                let composed = compose_states(l, r);
                let previous = state_tx.send_replace(composed);
                if previous != composed {
                    info!("{} is {:?} (left {:?}, right {:?})", id, composed, l, r);
                    let _ = events.send(DeviceEvent::ConnectionState {
                        device_id: id.clone(),
                        state: composed,
                    });
                }

                if previous == ConnectionState::Connected && is_one_sided_drop(l, r) {
                    warn!("{} lost one side, disconnecting the other", id);
                    tear_down(&sessions.0, &sessions.1).await;
                    continue;
                }

                tokio::select! {
                    changed = left.changed() => if changed.is_err() { break },
                    changed = right.changed() => if changed.is_err() { break },
                }
            }
        })
    }

    fn spawn_packet_forwarder(&self, session: &DeviceSession) -> JoinHandle<()> {
        let mut unsolicited = session.unsolicited();
        let side = session.side();
        let events = self.events.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            loop {
                match unsolicited.recv().await {
                    Ok(packet) => {
                        if let Some(event) = to_event(&id, side, &packet) {
                            let _ = events.send(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} ({}) dropped {} events", id, side, skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_battery_forwarder(&self, session: &DeviceSession) -> JoinHandle<()> {
        let mut battery = session.battery_changes();
        let side = session.side();
        let events = self.events.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            while battery.changed().await.is_ok() {
                let level = battery.borrow_and_update().map(|b| b.level);
                if let Some(level) = level {
                    let _ = events.send(DeviceEvent::Battery {
                        device_id: id.clone(),
                        side,
                        level,
                    });
                }
            }
        })
    }

    /// Connect both sides concurrently. Succeeds only if both do; otherwise
    /// both are torn down.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        self.ensure_watchers();
        info!("Connecting {} ({})", self.name, self.id);

        let attempt = ConnectAttempt {
            left: self.left.clone(),
            right: self.right.clone(),
            armed: true,
        };
        let result = tokio::try_join!(self.left.connect(), self.right.connect());
        attempt.finish();

        if let Err(e) = result {
            warn!("Connecting {} failed: {}", self.id, e);
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Disconnect both sides, regardless of either outcome
    pub async fn disconnect(&self) {
        tear_down(&self.left, &self.right).await;
    }

    async fn send_to_both(&self, packet: OutgoingPacket) -> bool {
        for session in [&self.left, &self.right] {
            if let Err(e) = session.send_request_for_response(packet.clone()).await {
                warn!(
                    "{:?} to {} side of {} failed: {}",
                    packet.packet_type(),
                    session.side(),
                    self.id,
                    e
                );
                return false;
            }
        }
        true
    }

    pub async fn send_text(&self, page: &TextPage) -> bool {
        self.send_to_both(OutgoingPacket::text_page(page)).await
    }

    pub async fn stop_displaying(&self) -> bool {
        self.send_to_both(OutgoingPacket::exit()).await
    }
}

impl Drop for CompositeDevice {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
