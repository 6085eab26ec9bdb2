use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use beaconet_core::metadata::MetaData;
use beaconet_core::node_record::NodeRecord;
use beaconet_core::throughput::ThroughputEstimator;
use beaconet_core::{AgentKind, PeerId};

use crate::quota::RequestQuota;
use crate::score::{PeerScoreCell, ScoreAction, ScoreUpdate, NEW_PEER_SCORE};
use crate::switch::Direction;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    None,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::None => "none",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What the state machine decided about a new physical connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// First logical connection: run the per-protocol connect handlers.
    StartHandshake,
    /// Extra transport to an already-known connection; counted, the first
    /// one stays authoritative.
    Duplicate,
    /// Arrived while tearing down; it will be closed with the rest.
    Ignored,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClosedOutcome {
    /// Last physical connection gone; the peer is now Disconnected.
    FullyDisconnected,
    StillConnected,
}

struct PeerInner {
    state: ConnectionState,
    direction: Direction,
    /// Physical connection refcount; Disconnected fires only at zero.
    connections: u32,
    metadata: Option<MetaData>,
    last_metadata: Option<Instant>,
    agent: AgentKind,
    node_record: Option<NodeRecord>,
    protocol_states: Vec<Option<Box<dyn Any + Send + Sync>>>,
    first_seen: Instant,
    direct: bool,
}

/// Everything we track about one peer. Shared as `Arc<Peer>`; the record
/// stays in the pool until the final Disconnected event and all protocol
/// handlers have returned.
pub struct Peer {
    pub peer_id: PeerId,
    inner: Mutex<PeerInner>,
    score: PeerScoreCell,
    pub quota: RequestQuota,
    pub throughput: ThroughputEstimator,
    metadata_failures: AtomicU32,
    low_score_trigger: AtomicBool,
    disconnected_flag: AtomicBool,
    disconnected_notify: Notify,
}

impl Peer {
    pub fn new(
        peer_id: PeerId,
        direction: Direction,
        quota_capacity: usize,
        full_replenish_time: Duration,
    ) -> Peer {
        Peer {
            peer_id,
            inner: Mutex::new(PeerInner {
                state: ConnectionState::None,
                direction,
                connections: 0,
                metadata: None,
                last_metadata: None,
                agent: AgentKind::Unknown,
                node_record: None,
                protocol_states: Vec::new(),
                first_seen: Instant::now(),
                direct: false,
            }),
            score: PeerScoreCell::new(NEW_PEER_SCORE),
            quota: RequestQuota::new(quota_capacity, full_replenish_time),
            throughput: ThroughputEstimator::new(),
            metadata_failures: AtomicU32::new(0),
            low_score_trigger: AtomicBool::new(false),
            disconnected_flag: AtomicBool::new(false),
            disconnected_notify: Notify::new(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn direction(&self) -> Direction {
        self.inner.lock().direction
    }

    pub fn connections(&self) -> u32 {
        self.inner.lock().connections
    }

    /// Inbound streams are serviced only in these states.
    pub fn accepts_streams(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    pub fn on_connection_opened(&self, direction: Direction) -> ConnectOutcome {
        let mut g = self.inner.lock();
        match g.state {
            ConnectionState::None | ConnectionState::Disconnected => {
                if g.state == ConnectionState::Disconnected {
                    // Re-encounter: earn trust again from zero.
                    self.score.reset(0);
                    self.disconnected_flag.store(false, Ordering::Release);
                    self.metadata_failures.store(0, Ordering::Relaxed);
                    self.low_score_trigger.store(false, Ordering::Relaxed);
                }
                g.state = ConnectionState::Connecting;
                g.direction = direction;
                g.connections = 1;
                ConnectOutcome::StartHandshake
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                g.connections += 1;
                ConnectOutcome::Duplicate
            }
            ConnectionState::Disconnecting => {
                g.connections += 1;
                ConnectOutcome::Ignored
            }
        }
    }

    /// All per-protocol connect handlers completed.
    pub fn mark_connected(&self) -> bool {
        let mut g = self.inner.lock();
        if g.state == ConnectionState::Connecting {
            g.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Disconnect requested; the caller records the seen-table entry before
    /// touching the transport.
    pub fn begin_disconnect(&self) -> bool {
        let mut g = self.inner.lock();
        match g.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                g.state = ConnectionState::Disconnecting;
                true
            }
            _ => false,
        }
    }

    pub fn on_connection_closed(&self) -> ClosedOutcome {
        let mut g = self.inner.lock();
        g.connections = g.connections.saturating_sub(1);
        if g.connections > 0 {
            return ClosedOutcome::StillConnected;
        }
        g.state = ConnectionState::Disconnected;
        drop(g);
        self.disconnected_flag.store(true, Ordering::Release);
        self.disconnected_notify.notify_waiters();
        ClosedOutcome::FullyDisconnected
    }

    /// Resolves once the peer reaches Disconnected.
    pub async fn wait_disconnected(&self) {
        loop {
            let notified = self.disconnected_notify.notified();
            if self.disconnected_flag.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub fn score(&self) -> i32 {
        self.score.get()
    }

    pub fn apply_score(&self, action: ScoreAction) -> ScoreUpdate {
        let update = self.score.apply(action);
        if update.crossed_low {
            self.low_score_trigger.store(true, Ordering::Relaxed);
        }
        tracing::trace!(peer = %self.peer_id, ?action, score = update.new_score, "score updated");
        update
    }

    /// One-shot: true exactly once after the score crossed the low limit.
    pub fn take_low_score_trigger(&self) -> bool {
        self.low_score_trigger.swap(false, Ordering::Relaxed)
    }

    pub fn metadata(&self) -> Option<MetaData> {
        self.inner.lock().metadata
    }

    pub fn set_metadata(&self, metadata: MetaData) {
        let mut g = self.inner.lock();
        g.metadata = Some(metadata);
        g.last_metadata = Some(Instant::now());
    }

    pub fn metadata_age(&self) -> Option<Duration> {
        self.inner.lock().last_metadata.map(|t| t.elapsed())
    }

    /// Forces the pinger to refresh this peer's metadata out of schedule.
    pub fn mark_metadata_stale(&self) {
        self.inner.lock().last_metadata = None;
    }

    pub fn record_metadata_failure(&self) -> u32 {
        self.metadata_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_metadata_failures(&self) {
        self.metadata_failures.store(0, Ordering::Relaxed);
    }

    pub fn agent(&self) -> AgentKind {
        self.inner.lock().agent
    }

    pub fn set_agent_version(&self, agent_version: &str) {
        self.inner.lock().agent = AgentKind::detect(agent_version);
    }

    pub fn node_record(&self) -> Option<NodeRecord> {
        self.inner.lock().node_record.clone()
    }

    /// Keeps the record with the highest sequence number.
    pub fn set_node_record(&self, record: NodeRecord) {
        let mut g = self.inner.lock();
        match &g.node_record {
            Some(existing) if existing.seq >= record.seq => {}
            _ => g.node_record = Some(record),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.inner.lock().direct
    }

    pub fn mark_direct(&self) {
        self.inner.lock().direct = true;
    }

    pub fn age(&self) -> Duration {
        self.inner.lock().first_seen.elapsed()
    }

    /// Installs the per-protocol state slot assigned at mount time.
    pub fn init_protocol_state(&self, index: usize, state: Option<Box<dyn Any + Send + Sync>>) {
        let mut g = self.inner.lock();
        if g.protocol_states.len() <= index {
            g.protocol_states.resize_with(index + 1, || None);
        }
        g.protocol_states[index] = state;
    }

    /// Runs `f` over the downcast per-protocol state slot.
    pub fn with_protocol_state<T: 'static, R>(
        &self,
        index: usize,
        f: impl FnOnce(Option<&mut T>) -> R,
    ) -> R {
        let mut g = self.inner.lock();
        let slot = g
            .protocol_states
            .get_mut(index)
            .and_then(|s| s.as_mut())
            .and_then(|s| s.downcast_mut::<T>());
        f(slot)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.peer_id)
            .field("state", &self.connection_state())
            .field("score", &self.score())
            .finish_non_exhaustive()
    }
}
