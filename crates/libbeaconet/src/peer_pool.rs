use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use beaconet_core::PeerId;

use crate::peer::{ConnectionState, Peer};
use crate::switch::Direction;

/// Outcome of trying to admit a peer.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmissionError {
    LowScore,
    NoSpace,
    Duplicate,
    DeadPeer,
}

type ScoreCheck = Box<dyn Fn(&Peer) -> bool + Send + Sync>;
type CountChanged = Box<dyn Fn(usize, usize) + Send + Sync>;
type OnDelete = Box<dyn Fn(&Arc<Peer>) + Send + Sync>;

/// Bounded multiset of live peers keyed by id, with directional counts,
/// score-gated admission, and removal callbacks.
pub struct PeerPool {
    peers: DashMap<PeerId, Arc<Peer>>,
    incoming: AtomicUsize,
    outgoing: AtomicUsize,
    max_peers: usize,
    score_check: ScoreCheck,
    on_count_changed: CountChanged,
    on_delete: OnDelete,
}

impl PeerPool {
    pub fn new(max_peers: usize, score_check: ScoreCheck) -> Self {
        PeerPool {
            peers: DashMap::new(),
            incoming: AtomicUsize::new(0),
            outgoing: AtomicUsize::new(0),
            max_peers,
            score_check,
            on_count_changed: Box::new(|_, _| {}),
            on_delete: Box::new(|_| {}),
        }
    }

    pub fn set_on_count_changed(&mut self, f: CountChanged) {
        self.on_count_changed = f;
    }

    pub fn set_on_delete(&mut self, f: OnDelete) {
        self.on_delete = f;
    }

    pub fn add(&self, peer: Arc<Peer>, direction: Direction) -> Result<(), AdmissionError> {
        if peer.connection_state() == ConnectionState::Disconnected {
            return Err(AdmissionError::DeadPeer);
        }
        if !peer.is_direct() && !(self.score_check)(&peer) {
            return Err(AdmissionError::LowScore);
        }
        if self.peers.contains_key(&peer.peer_id) {
            return Err(AdmissionError::Duplicate);
        }
        // Checked outside the entry guard; dashmap's len takes every shard.
        if self.len() >= self.max_peers {
            return Err(AdmissionError::NoSpace);
        }
        use dashmap::mapref::entry::Entry;
        match self.peers.entry(peer.peer_id) {
            Entry::Occupied(_) => Err(AdmissionError::Duplicate),
            Entry::Vacant(vac) => {
                vac.insert(peer);
                match direction {
                    Direction::Incoming => self.incoming.fetch_add(1, Ordering::Relaxed),
                    Direction::Outgoing => self.outgoing.fetch_add(1, Ordering::Relaxed),
                };
                self.notify_count_changed();
                Ok(())
            }
        }
    }

    pub fn remove(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.remove_if(peer_id, |_| true)
    }

    /// Removes the peer only while `predicate` holds under the map lock, so
    /// a teardown can't evict an entry a concurrent reconnect resurrected.
    pub fn remove_if(
        &self,
        peer_id: &PeerId,
        predicate: impl FnOnce(&Arc<Peer>) -> bool,
    ) -> Option<Arc<Peer>> {
        let (_, peer) = self.peers.remove_if(peer_id, |_, p| predicate(p))?;
        match peer.direction() {
            Direction::Incoming => self.incoming.fetch_sub(1, Ordering::Relaxed),
            Direction::Outgoing => self.outgoing.fetch_sub(1, Ordering::Relaxed),
        };
        (self.on_delete)(&peer);
        self.notify_count_changed();
        Some(peer)
    }

    fn notify_count_changed(&self) {
        (self.on_count_changed)(
            self.incoming.load(Ordering::Relaxed),
            self.outgoing.load(Ordering::Relaxed),
        );
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn count(&self, direction: Direction) -> usize {
        match direction {
            Direction::Incoming => self.incoming.load(Ordering::Relaxed),
            Direction::Outgoing => self.outgoing.load(Ordering::Relaxed),
        }
    }

    /// Excess over the steering target; feeds the trimmer.
    pub fn excess(&self, target: usize) -> usize {
        self.len().saturating_sub(target)
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connected(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|e| e.value().connection_state() == ConnectionState::Connected)
            .map(|e| e.value().clone())
            .collect()
    }
}
