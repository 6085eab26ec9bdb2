use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqresp_protocol::GoodbyeReason;

use beaconet_core::PeerId;

/// Why a peer left (or a dial concluded). Picks the reconnect-suppression
/// TTL and, where applicable, the goodbye code sent on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Dial attempt timed out.
    Timeout,
    /// Dial attempt failed outright.
    Dead,
    /// Dial succeeded; short cooldown only so a dropped connection can
    /// be re-established quickly.
    Success,
    ClientShutDown,
    IrrelevantNetwork,
    FaultOrError,
    ScoreLow,
    /// Trimmed to make room; distinct short TTL so benign evictions do not
    /// look like faults.
    BenignReconnect,
}

impl DisconnectReason {
    pub fn ttl(&self) -> Duration {
        match self {
            DisconnectReason::Timeout => Duration::from_secs(5 * 60),
            DisconnectReason::Dead => Duration::from_secs(5 * 60),
            DisconnectReason::Success => Duration::from_secs(30),
            DisconnectReason::ClientShutDown => Duration::from_secs(10 * 60),
            DisconnectReason::IrrelevantNetwork => Duration::from_secs(24 * 60 * 60),
            DisconnectReason::FaultOrError => Duration::from_secs(10 * 60),
            DisconnectReason::ScoreLow => Duration::from_secs(60 * 60),
            DisconnectReason::BenignReconnect => Duration::from_secs(60),
        }
    }

    /// Wire goodbye code for reasons that terminate a live connection.
    pub fn goodbye(&self) -> Option<GoodbyeReason> {
        match self {
            DisconnectReason::ClientShutDown => Some(GoodbyeReason::ClientShutDown),
            DisconnectReason::IrrelevantNetwork => Some(GoodbyeReason::IrrelevantNetwork),
            DisconnectReason::FaultOrError => Some(GoodbyeReason::FaultOrError),
            DisconnectReason::ScoreLow => Some(GoodbyeReason::PeerScoreLow),
            DisconnectReason::BenignReconnect => Some(GoodbyeReason::TooManyPeers),
            DisconnectReason::Timeout | DisconnectReason::Dead | DisconnectReason::Success => None,
        }
    }
}

/// Recently-seen suppression: while an entry is unexpired, the connector
/// will not dial that peer.
pub struct SeenTable {
    entries: Mutex<HashMap<PeerId, Instant>>,
    capacity: usize,
}

impl SeenTable {
    pub fn new(capacity: usize) -> Self {
        SeenTable {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Records `peer` with the reason's TTL. A later expiry always wins over
    /// an earlier one.
    pub fn add(&self, peer: PeerId, reason: DisconnectReason) {
        self.add_until(peer, Instant::now() + reason.ttl())
    }

    fn add_until(&self, peer: PeerId, expiry: Instant) {
        let mut g = self.entries.lock();
        let slot = g.entry(peer).or_insert(expiry);
        if *slot < expiry {
            *slot = expiry;
        }
        if g.len() > self.capacity {
            // Evict whatever expires soonest.
            let len = g.len();
            let mut expiries: Vec<Instant> = g.values().copied().collect();
            expiries.sort_unstable();
            let cutoff = expiries[len - self.capacity];
            g.retain(|_, e| *e > cutoff);
        }
    }

    pub fn is_seen(&self, peer: &PeerId) -> bool {
        let mut g = self.entries.lock();
        match g.get(peer) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                g.remove(peer);
                false
            }
            None => false,
        }
    }

    pub fn expiry(&self, peer: &PeerId) -> Option<Instant> {
        self.entries.lock().get(peer).copied()
    }

    /// Lifts the suppression early; used for configured peers that must be
    /// re-dialed regardless of how they left.
    pub fn remove(&self, peer: &PeerId) {
        self.entries.lock().remove(peer);
    }

    /// Drops expired entries; called opportunistically by maintenance loops.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, e| *e > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(b: u8) -> PeerId {
        PeerId::new([b; 32])
    }

    #[test]
    fn test_seen_until_expiry() {
        let t = SeenTable::new(16);
        t.add(pid(1), DisconnectReason::IrrelevantNetwork);
        assert!(t.is_seen(&pid(1)));
        assert!(!t.is_seen(&pid(2)));
    }

    #[test]
    fn test_expiry_reflects_reason_ttl() {
        let t = SeenTable::new(16);
        let before = Instant::now();
        t.add(pid(1), DisconnectReason::ScoreLow);
        let expiry = t.expiry(&pid(1)).unwrap();
        let ttl = expiry - before;
        assert!(ttl >= Duration::from_secs(59 * 60) && ttl <= Duration::from_secs(61 * 60));
    }

    #[test]
    fn test_remove_lifts_suppression() {
        let t = SeenTable::new(16);
        t.add(pid(1), DisconnectReason::IrrelevantNetwork);
        assert!(t.is_seen(&pid(1)));
        t.remove(&pid(1));
        assert!(!t.is_seen(&pid(1)));
    }

    #[test]
    fn test_later_expiry_wins() {
        let t = SeenTable::new(16);
        t.add(pid(1), DisconnectReason::IrrelevantNetwork);
        let long = t.expiry(&pid(1)).unwrap();
        t.add(pid(1), DisconnectReason::BenignReconnect);
        assert_eq!(t.expiry(&pid(1)).unwrap(), long);
    }

    #[test]
    fn test_bounded_evicts_soonest_expiring() {
        let t = SeenTable::new(4);
        t.add(pid(0), DisconnectReason::IrrelevantNetwork);
        for b in 1..=4 {
            t.add(pid(b), DisconnectReason::BenignReconnect);
        }
        assert!(t.len() <= 4);
        // The long-TTL entry must have survived.
        assert!(t.is_seen(&pid(0)));
    }

    #[test]
    fn test_goodbye_mapping() {
        assert_eq!(
            DisconnectReason::ScoreLow.goodbye(),
            Some(GoodbyeReason::PeerScoreLow)
        );
        assert_eq!(DisconnectReason::Timeout.goodbye(), None);
        assert_eq!(
            DisconnectReason::BenignReconnect.goodbye(),
            Some(GoodbyeReason::TooManyPeers)
        );
    }
}
