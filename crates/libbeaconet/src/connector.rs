use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace};

use beaconet_core::node_record::PeerAddress;
use beaconet_core::spawn_utils::spawn_with_cancel;
use beaconet_core::PeerId;

use crate::peer_pool::PeerPool;
use crate::seen_table::{DisconnectReason, SeenTable};
use crate::switch::Switch;

#[derive(Default, Serialize)]
pub struct DialStats {
    pub ok: AtomicU64,
    pub timeout: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

/// State the dial workers share with the rest of the network.
pub(crate) struct ConnectorShared {
    pub switch: Arc<dyn Switch>,
    pub seen: Arc<SeenTable>,
    pub pool: Arc<PeerPool>,
    /// Peers with a dial queued or in flight; cleared after disposition.
    pub pending: Mutex<HashSet<PeerId>>,
    pub stats: DialStats,
    pub connect_timeout: Duration,
}

/// Bounded pool of dial workers draining a bounded queue of addresses.
/// At most `workers` tasks are ever inside `switch.connect` at once.
pub(crate) struct Connector {
    tx: mpsc::Sender<PeerAddress>,
    shared: Arc<ConnectorShared>,
}

impl Connector {
    pub fn start(
        queue_size: usize,
        workers: usize,
        shared: Arc<ConnectorShared>,
        cancel: &CancellationToken,
    ) -> Connector {
        let (tx, rx) = mpsc::channel::<PeerAddress>(queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for n in 0..workers {
            let rx = rx.clone();
            let shared = shared.clone();
            spawn_with_cancel(
                debug_span!("connect_worker", n),
                cancel.child_token(),
                async move {
                    loop {
                        let addr = { rx.lock().await.recv().await };
                        let Some(addr) = addr else { return Ok(()) };
                        dial_one(&shared, addr).await;
                    }
                },
            );
        }
        Connector { tx, shared }
    }

    /// Queues a dial unless the peer is connected, suppressed, already
    /// pending, or the queue is full.
    pub fn try_enqueue(&self, addr: PeerAddress) -> bool {
        let peer_id = addr.peer_id;
        if self.shared.pool.contains(&peer_id) || self.shared.seen.is_seen(&peer_id) {
            return false;
        }
        if !self.shared.pending.lock().insert(peer_id) {
            return false;
        }
        match self.tx.try_send(addr) {
            Ok(()) => true,
            Err(e) => {
                trace!(peer = %peer_id, "dial queue full: {e}");
                self.shared.pending.lock().remove(&peer_id);
                false
            }
        }
    }
}

async fn dial_one(shared: &ConnectorShared, addr: PeerAddress) {
    let peer_id = addr.peer_id;
    // Things change while queued; re-check before spending a dial.
    if shared.pool.contains(&peer_id) || shared.seen.is_seen(&peer_id) {
        shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
        shared.pending.lock().remove(&peer_id);
        return;
    }

    match timeout(shared.connect_timeout, shared.switch.connect(&addr)).await {
        Err(_) => {
            debug!(peer = %peer_id, "dial timed out");
            shared.seen.add(peer_id, DisconnectReason::Timeout);
            shared.stats.timeout.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            debug!(peer = %peer_id, "dial failed: {e:#}");
            shared.seen.add(peer_id, DisconnectReason::Dead);
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Ok(())) => {
            trace!(peer = %peer_id, "dial succeeded");
            shared.seen.add(peer_id, DisconnectReason::Success);
            shared.stats.ok.fetch_add(1, Ordering::Relaxed);
        }
    }
    shared.pending.lock().remove(&peer_id);
}
