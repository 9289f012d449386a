//! One side of the wearable: a link plus request correlation and telemetry.

use crate::domain::models::{BatteryInfo, ConnectionState, DashboardStatus, Side};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::bonding::BondingCoordinator;
use crate::infrastructure::bluetooth::connection::{LinkConfig, PeripheralLink};
use crate::infrastructure::bluetooth::error::{DeviceError, GattFailure};
use crate::infrastructure::bluetooth::hal::BleHal;
use crate::infrastructure::bluetooth::protocol::{
    IncomingPacket, IncomingPayload, OutgoingPacket, PacketType,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type RequestResult = Result<IncomingPacket, DeviceError>;

/// A request that just became current and must be written
pub type Dispatch = (u64, OutgoingPacket);

struct PendingRequest {
    id: u64,
    packet: OutgoingPacket,
    responder: oneshot::Sender<RequestResult>,
    /// Set when the request becomes current
    expires_at: Option<Instant>,
}

impl PendingRequest {
    fn resolve(self, result: RequestResult) {
        // The caller may have stopped waiting
        let _ = self.responder.send(result);
    }
}

/// At most one request in flight, the rest waiting in submission order
pub struct RequestQueue {
    address: String,
    expiry: Duration,
    next_id: u64,
    current: Option<PendingRequest>,
    waiting: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub fn new(address: impl Into<String>, expiry: Duration) -> Self {
        Self {
            address: address.into(),
            expiry,
            next_id: 0,
            current: None,
            waiting: VecDeque::new(),
        }
    }

    /// Returns the dispatch when the request went straight to the in-flight slot
    pub fn submit(
        &mut self,
        packet: OutgoingPacket,
        responder: oneshot::Sender<RequestResult>,
        now: Instant,
    ) -> Option<Dispatch> {
        let id = self.next_id;
        self.next_id += 1;

        let request = PendingRequest {
            id,
            packet,
            responder,
            expires_at: None,
        };
        self.waiting.push_back(request);

        if self.current.is_none() {
            self.promote(now)
        } else {
            None
        }
    }

    /// Resolve the current request if `packet` answers it
    pub fn complete(&mut self, packet: &IncomingPacket) -> bool {
        let answers = match (&self.current, packet.responds_to()) {
            (Some(current), Some(kind)) => current.packet.packet_type() == kind,
            _ => false,
        };
        if !answers {
            return false;
        }

        if let Some(current) = self.current.take() {
            current.resolve(Ok(packet.clone()));
        }
        true
    }

    /// Move the oldest waiting request into the empty in-flight slot
    pub fn promote(&mut self, now: Instant) -> Option<Dispatch> {
        if self.current.is_some() {
            return None;
        }
        let mut next = self.waiting.pop_front()?;
        next.expires_at = Some(now + self.expiry);
        let dispatch = (next.id, next.packet.clone());
        self.current = Some(next);
        Some(dispatch)
    }

    /// Fail the current request if its expiry has passed
    pub fn expire(&mut self, now: Instant) -> bool {
        let expired = self
            .current
            .as_ref()
            .and_then(|c| c.expires_at)
            .is_some_and(|at| at <= now);
        if !expired {
            return false;
        }

        if let Some(current) = self.current.take() {
            warn!(
                "{:?} request to {} expired",
                current.packet.packet_type(),
                self.address
            );
            let packet_type = current.packet.packet_type();
            current.resolve(Err(DeviceError::RequestTimeout {
                address: self.address.clone(),
                packet_type,
            }));
        }
        true
    }

    /// Fail request `id` if it is still the current one
    pub fn fail(&mut self, id: u64, error: DeviceError) -> bool {
        if self.current.as_ref().map(|c| c.id) != Some(id) {
            return false;
        }
        if let Some(current) = self.current.take() {
            current.resolve(Err(error));
        }
        true
    }

    /// Resolve everything with `SessionClosed`
    pub fn close(&mut self) {
        let pending = self.current.take().into_iter().chain(self.waiting.drain(..));
        for request in pending {
            request.resolve(Err(DeviceError::SessionClosed {
                address: self.address.clone(),
            }));
        }
    }

    pub fn in_flight(&self) -> Option<PacketType> {
        self.current.as_ref().map(|c| c.packet.packet_type())
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}

struct SessionShared {
    side: Side,
    link: PeripheralLink,
    queue: Mutex<RequestQueue>,
    battery_tx: watch::Sender<Option<BatteryInfo>>,
    dashboard_tx: watch::Sender<Option<DashboardStatus>>,
    unsolicited_tx: broadcast::Sender<IncomingPacket>,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingPacket>>,
}

impl SessionShared {
    /// Write dispatched requests until one goes out. A failed write resolves
    /// its request and promotes the next.
    async fn dispatch(&self, mut next: Option<Dispatch>) {
        while let Some((id, packet)) = next {
            if self.link.send(&packet).await {
                return;
            }

            let mut queue = self.queue.lock();
            queue.fail(
                id,
                DeviceError::gatt(
                    self.link.address(),
                    "send request",
                    GattFailure::WriteFailed,
                ),
            );
            next = queue.promote(Instant::now());
        }
    }

    async fn route(&self, packet: IncomingPacket) {
        match packet.payload() {
            IncomingPayload::Battery { level: Some(level) } => {
                self.battery_tx.send_replace(Some(BatteryInfo {
                    level: *level,
                    updated_at: SystemTime::now(),
                }));
            }
            IncomingPayload::Dashboard(status) => {
                self.dashboard_tx.send_replace(Some(*status));
            }
            _ => {}
        }

        let next = {
            let mut queue = self.queue.lock();
            if queue.complete(&packet) {
                Some(queue.promote(Instant::now()))
            } else {
                None
            }
        };

        match next {
            Some(next) => self.dispatch(next).await,
            None if packet.packet_type() == PacketType::BatteryLevel => {}
            None => {
                debug!(
                    "{} ({}) unsolicited {:?}",
                    self.link.address(),
                    self.side,
                    packet.packet_type()
                );
                let _ = self.unsolicited_tx.send(packet);
            }
        }
    }

    async fn sweep_expired(&self) {
        let next = {
            let mut queue = self.queue.lock();
            let now = Instant::now();
            if queue.expire(now) {
                queue.promote(now)
            } else {
                None
            }
        };
        self.dispatch(next).await;
    }
}

/// One side of the wearable
pub struct DeviceSession {
    shared: Arc<SessionShared>,
    bonding: Arc<BondingCoordinator>,
    heartbeat_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceSession {
    pub fn new(
        hal: Arc<dyn BleHal>,
        bonding: Arc<BondingCoordinator>,
        address: &str,
        side: Side,
        settings: &BleSettings,
    ) -> Self {
        let link = PeripheralLink::new(hal, address, LinkConfig::from(settings));
        let packets = link.take_packets().unwrap_or_else(|| mpsc::unbounded_channel().1);
        let (battery_tx, _) = watch::channel(None);
        let (dashboard_tx, _) = watch::channel(None);
        let (unsolicited_tx, _) = broadcast::channel(64);

        Self {
            shared: Arc::new(SessionShared {
                side,
                link,
                queue: Mutex::new(RequestQueue::new(address, settings.request_expiry())),
                battery_tx,
                dashboard_tx,
                unsolicited_tx,
                packets: tokio::sync::Mutex::new(packets),
            }),
            bonding,
            heartbeat_interval: settings.heartbeat_interval(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn side(&self) -> Side {
        self.shared.side
    }

    pub fn address(&self) -> &str {
        self.shared.link.address()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.link.state_changes()
    }

    pub fn battery(&self) -> Option<BatteryInfo> {
        *self.shared.battery_tx.borrow()
    }

    pub fn battery_changes(&self) -> watch::Receiver<Option<BatteryInfo>> {
        self.shared.battery_tx.subscribe()
    }

    pub fn dashboard(&self) -> Option<DashboardStatus> {
        *self.shared.dashboard_tx.borrow()
    }

    /// Packets that answered no request: gestures, dashboard reports and
    /// stray responses
    pub fn unsolicited(&self) -> broadcast::Receiver<IncomingPacket> {
        self.shared.unsolicited_tx.subscribe()
    }

    /// Bond, connect and start the heartbeat and packet router.
    ///
    /// An authentication failure triggers one re-bond and reconnect.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let address = self.address().to_string();
        self.bonding.ensure_bonded(&address).await?;

        match self.shared.link.connect().await {
            Ok(()) => {}
            Err(DeviceError::InsufficientAuthentication { status, .. }) => {
                warn!(
                    "{} rejected the connection (status {}), re-bonding once",
                    address, status
                );
                self.bonding.rebond(&address).await?;
                self.shared.link.disconnect().await;
                self.shared.link.connect().await?;
            }
            Err(e) => return Err(e),
        }

        self.start_tasks();
        info!("{} session on {} ready", self.side(), address);
        Ok(())
    }

    fn start_tasks(&self) {
        let router_shared = self.shared.clone();
        let router = tokio::spawn(async move {
            let mut packets = router_shared.packets.lock().await;
            while let Some(packet) = packets.recv().await {
                router_shared.route(packet).await;
            }
        });

        let heartbeat_shared = self.shared.clone();
        let interval = self.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                heartbeat_shared.sweep_expired().await;
                if !heartbeat_shared
                    .link
                    .send(&OutgoingPacket::battery_level())
                    .await
                {
                    debug!(
                        "Heartbeat to {} not delivered",
                        heartbeat_shared.link.address()
                    );
                }
            }
        });

        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.push(router);
        tasks.push(heartbeat);
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Send `packet` once it is this session's turn and wait for its answer
    pub async fn send_request_for_response(&self, packet: OutgoingPacket) -> RequestResult {
        let (tx, rx) = oneshot::channel();
        let dispatch = self.shared.queue.lock().submit(packet, tx, Instant::now());
        self.shared.dispatch(dispatch).await;

        rx.await.unwrap_or_else(|_| {
            Err(DeviceError::SessionClosed {
                address: self.address().to_string(),
            })
        })
    }

    /// Fire-and-forget write outside the request queue
    pub async fn send(&self, packet: &OutgoingPacket) -> bool {
        self.shared.link.send(packet).await
    }

    pub async fn disconnect(&self) {
        self.stop_tasks();
        self.shared.queue.lock().close();
        self.shared.link.disconnect().await;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol;
    use crate::infrastructure::bluetooth::simulated::{SimulatedBle, SimulatedPeripheral};

    const ADDR: &str = "AA:00:00:00:00:01";

    fn response(bytes: &[u8]) -> IncomingPacket {
        protocol::decode(bytes).unwrap()
    }

    fn setup(peripheral: SimulatedPeripheral) -> (SimulatedBle, DeviceSession) {
        let sim = SimulatedBle::new();
        sim.add_peripheral(peripheral);
        let hal: Arc<dyn BleHal> = Arc::new(sim.clone());
        let bonding = Arc::new(BondingCoordinator::new(hal.clone(), Duration::from_secs(20)));
        let session = DeviceSession::new(hal, bonding, ADDR, Side::Left, &BleSettings::default());
        (sim, session)
    }

    fn left() -> SimulatedPeripheral {
        SimulatedPeripheral::new(ADDR, "Even G1_7_L_39A1B2")
    }

    #[test]
    fn test_queue_resolves_in_fifo_order() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(ADDR, Duration::from_secs(5));
        let packets = [
            OutgoingPacket::exit(),
            OutgoingPacket::battery_level(),
            OutgoingPacket::send_text("a", 1, 1),
            OutgoingPacket::exit(),
        ];

        let mut receivers = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            let dispatch = queue.submit(packet.clone(), tx, now);
            assert_eq!(dispatch.is_some(), i == 0);
            receivers.push(rx);
        }
        assert_eq!(queue.in_flight(), Some(PacketType::Exit));
        assert_eq!(queue.waiting(), 3);

        // A response for a different type leaves the in-flight request alone
        assert!(!queue.complete(&response(&[0x4E, 0xC9])));

        let answers: [&[u8]; 4] = [&[0x18, 0xC9], &[0x2C, 0x66, 50], &[0x4E, 0xC9], &[0x18, 0xC9]];
        for (i, bytes) in answers.iter().enumerate() {
            assert!(queue.complete(&response(bytes)));
            let next = queue.promote(now);
            assert_eq!(next.map(|(_, p)| p), packets.get(i + 1).cloned());
        }
        assert!(!queue.complete(&response(&[0x18, 0xC9])));

        for (rx, packet) in receivers.iter_mut().zip(&packets) {
            let answer = rx.try_recv().unwrap().unwrap();
            assert_eq!(answer.responds_to(), Some(packet.packet_type()));
        }
    }

    #[test]
    fn test_queue_expiry_stamped_on_promotion() {
        let start = Instant::now();
        let mut queue = RequestQueue::new(ADDR, Duration::from_secs(5));
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        queue.submit(OutgoingPacket::exit(), tx1, start);
        queue.submit(OutgoingPacket::battery_level(), tx2, start);

        assert!(!queue.expire(start + Duration::from_secs(4)));
        assert!(queue.expire(start + Duration::from_secs(5)));
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(DeviceError::RequestTimeout {
                packet_type: PacketType::Exit,
                ..
            })
        ));

        let promoted_at = start + Duration::from_secs(8);
        assert!(queue.promote(promoted_at).is_some());
        assert!(!queue.expire(promoted_at + Duration::from_secs(4)));
        assert!(queue.expire(promoted_at + Duration::from_secs(5)));
        assert!(rx2.try_recv().unwrap().is_err());
        assert!(queue.promote(promoted_at).is_none());
    }

    #[test]
    fn test_queue_fail_and_close() {
        let now = Instant::now();
        let mut queue = RequestQueue::new(ADDR, Duration::from_secs(5));
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let (id, _) = queue.submit(OutgoingPacket::exit(), tx1, now).unwrap();
        queue.submit(OutgoingPacket::exit(), tx2, now);

        assert!(!queue.fail(id + 1, DeviceError::NotFound("x".into())));
        assert!(queue.fail(id, DeviceError::NotFound("x".into())));
        assert!(rx1.try_recv().unwrap().is_err());

        queue.close();
        assert_eq!(
            rx2.try_recv().unwrap().unwrap_err(),
            DeviceError::SessionClosed {
                address: ADDR.to_string()
            }
        );
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_requests_are_written_one_at_a_time() {
        let (sim, session) = setup(left());
        session.connect().await.unwrap();

        let (a, b, c) = tokio::join!(
            session.send_request_for_response(OutgoingPacket::exit()),
            session.send_request_for_response(OutgoingPacket::battery_level()),
            session.send_request_for_response(OutgoingPacket::send_text("hi", 1, 1)),
        );
        assert_eq!(a.unwrap().packet_type(), PacketType::Exit);
        assert_eq!(b.unwrap().payload(), &IncomingPayload::Battery { level: Some(80) });
        assert_eq!(c.unwrap().packet_type(), PacketType::SendText);

        let opcodes: Vec<u8> = sim.writes_to(ADDR).iter().map(|w| w[0]).collect();
        assert_eq!(opcodes, vec![0x18, 0x2C, 0x4E]);
        assert_eq!(session.battery().map(|b| b.level), Some(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_requests_expire_in_order() {
        let (sim, session) = setup(left().silent());
        session.connect().await.unwrap();

        let (a, b) = tokio::join!(
            session.send_request_for_response(OutgoingPacket::exit()),
            session.send_request_for_response(OutgoingPacket::send_text("x", 1, 1)),
        );
        assert!(matches!(
            a,
            Err(DeviceError::RequestTimeout {
                packet_type: PacketType::Exit,
                ..
            })
        ));
        assert!(matches!(
            b,
            Err(DeviceError::RequestTimeout {
                packet_type: PacketType::SendText,
                ..
            })
        ));

        // Both requests plus one direct battery poll per heartbeat tick
        let opcodes: Vec<u8> = sim.writes_to(ADDR).iter().map(|w| w[0]).collect();
        assert_eq!(opcodes, vec![0x18, 0x4E, 0x2C, 0x2C]);
    }

    #[tokio::test]
    async fn test_failed_write_resolves_and_promotes() {
        let (_sim, session) = setup(left().with_write_failures(3));
        session.connect().await.unwrap();

        let (a, b) = tokio::join!(
            session.send_request_for_response(OutgoingPacket::exit()),
            session.send_request_for_response(OutgoingPacket::exit()),
        );
        assert!(matches!(
            a,
            Err(DeviceError::Gatt {
                failure: GattFailure::WriteFailed,
                ..
            })
        ));
        assert_eq!(b.unwrap().packet_type(), PacketType::Exit);
    }

    #[tokio::test]
    async fn test_unsolicited_stream() {
        let (sim, session) = setup(left());
        session.connect().await.unwrap();
        let mut events = session.unsolicited();

        sim.notify(ADDR, &[0x29]);
        sim.notify(ADDR, &[0x18, 0xC9]);
        sim.notify(ADDR, &[0x2C, 0x66, 42]);
        sim.notify(ADDR, &[0x22, 0x05, 3, 0, 1, 0, 2, 0]);

        assert_eq!(events.recv().await.unwrap().packet_type(), PacketType::GestureTap);
        assert_eq!(events.recv().await.unwrap().packet_type(), PacketType::Exit);
        assert_eq!(
            events.recv().await.unwrap().packet_type(),
            PacketType::DashboardStatus
        );
        assert_eq!(session.battery().map(|b| b.level), Some(42));
        assert_eq!(
            session.dashboard(),
            Some(DashboardStatus {
                countdown_ticks: Some(3),
                current_page: Some(1),
                total_pages: Some(2),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_polls_battery() {
        let (_sim, session) = setup(left().with_battery_level(64));
        let mut battery = session.battery_changes();
        session.connect().await.unwrap();
        assert_eq!(session.battery(), None);

        let info = *battery.wait_for(|b| b.is_some()).await.unwrap();
        assert_eq!(info.map(|b| b.level), Some(64));
    }

    #[tokio::test]
    async fn test_auth_failure_gets_one_recovery_cycle() {
        let (sim, session) = setup(left().bonded().with_auth_failures(1));
        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(sim.bond_removals(), vec![ADDR.to_string()]);
        assert_eq!(sim.connect_attempts(ADDR), 2);

        let (sim, session) = setup(left().bonded().with_auth_failures(2));
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, DeviceError::InsufficientAuthentication { .. }));
        assert_eq!(sim.connect_attempts(ADDR), 2);
    }

    #[tokio::test]
    async fn test_disconnect_closes_pending_requests() {
        let (_sim, session) = setup(left().silent());
        session.connect().await.unwrap();
        let session = Arc::new(session);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .send_request_for_response(OutgoingPacket::exit())
                    .await
            })
        };
        tokio::task::yield_now().await;

        session.disconnect().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DeviceError::SessionClosed { .. })
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
