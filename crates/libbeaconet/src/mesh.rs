use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use beaconet_core::metadata::MetaData;
use beaconet_core::subnets::{AttnetBits, ColnetBits, SyncnetBits};
use beaconet_core::{ForkDigest, PeerId};

use crate::config::NetworkConfig;
use crate::gossip::router::GossipRouter;
use crate::gossip::topics;
use crate::peer::Peer;

/// Subnets whose gossip fan-out needs more peers, produced by the periodic
/// mesh scan and consumed as the discovery bias.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubnetNeeds {
    pub attnets: AttnetBits,
    pub syncnets: SyncnetBits,
    pub colnets: ColnetBits,
}

impl SubnetNeeds {
    pub fn is_empty(&self) -> bool {
        self.attnets.is_zero() && self.syncnets.is_zero() && self.colnets.is_zero()
    }
}

/// Health categories in preference order. A scan returns only the highest
/// non-empty category so the discovery bias chases the worst deficiency
/// first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Health {
    LowOutgoing,
    BelowD,
    BelowDOut,
    NotHighOutgoing,
}

fn classify(
    router: &dyn GossipRouter,
    topic: &str,
    cfg: &NetworkConfig,
) -> Option<Health> {
    let stats = router.mesh_stats(topic);
    if stats.topic_peers < cfg.gossip_d_low {
        Some(Health::LowOutgoing)
    } else if stats.mesh_peers < cfg.gossip_d_low {
        Some(Health::BelowD)
    } else if stats.outbound_mesh_peers < cfg.gossip_d_out {
        Some(Health::BelowDOut)
    } else if stats.topic_peers < cfg.gossip_d_high {
        Some(Health::NotHighOutgoing)
    } else {
        None
    }
}

/// Scores every subscribed subnet topic against the router's counters and
/// returns the needy subnets of the most pressing category.
pub(crate) fn scan_needy_subnets(
    router: &dyn GossipRouter,
    digest: ForkDigest,
    local: &MetaData,
    colnets: &ColnetBits,
    cfg: &NetworkConfig,
) -> SubnetNeeds {
    let mut best: Option<Health> = None;
    let mut needs_by_health: HashMap<Health, SubnetNeeds> = HashMap::new();

    let mut note = |health: Option<Health>, apply: &dyn Fn(&mut SubnetNeeds)| {
        if let Some(h) = health {
            apply(needs_by_health.entry(h).or_default());
            best = Some(match best {
                Some(b) if b <= h => b,
                _ => h,
            });
        }
    };

    for subnet in local.attnets.iter_ones() {
        let topic = topics::attestation_subnet(digest, subnet).full();
        note(classify(router, &topic, cfg), &|n| n.attnets.set(subnet, true));
    }
    for subnet in local.syncnets.iter_ones() {
        let topic = topics::sync_committee_subnet(digest, subnet).full();
        note(classify(router, &topic, cfg), &|n| n.syncnets.set(subnet, true));
    }
    for subnet in colnets.iter_ones() {
        let topic = topics::data_column_subnet(digest, subnet).full();
        note(classify(router, &topic, cfg), &|n| n.colnets.set(subnet, true));
    }

    match best {
        Some(h) => needs_by_health.remove(&h).unwrap_or_default(),
        None => SubnetNeeds::default(),
    }
}

/// Fraction of peers above which a topic stops contributing to keep-scores
/// (near-universal topics would bias every peer equally).
const UBIQUITY_CUTOFF: f64 = 0.75;

const MESH_WEIGHT: f64 = 5000.0;
const SUBSCRIBED_WEIGHT: f64 = 1000.0;
const STABILITY_WEIGHT: f64 = 10.0;

/// Picks the `excess` least valuable peers to drop. Direct peers never
/// qualify; peers whose metadata is still unknown get a grace period so
/// fresh connections aren't churned.
pub(crate) fn select_trim_candidates(
    peers: &[Arc<Peer>],
    router: &dyn GossipRouter,
    subscribed_topics: &[String],
    excess: usize,
    grace: Duration,
) -> Vec<Arc<Peer>> {
    if excess == 0 || peers.is_empty() {
        return Vec::new();
    }

    struct TopicView {
        mesh: HashSet<PeerId>,
        subscribed: HashSet<PeerId>,
    }
    let total = peers.len();
    let views: Vec<TopicView> = subscribed_topics
        .iter()
        .map(|t| TopicView {
            mesh: router.mesh_peers(t).into_iter().collect(),
            subscribed: router.subscribed_peers(t).into_iter().collect(),
        })
        .filter(|v| (v.subscribed.len() as f64) <= UBIQUITY_CUTOFF * total as f64)
        .collect();

    let mut scored: Vec<(f64, Arc<Peer>)> = peers
        .iter()
        .filter(|p| !p.is_direct())
        .filter(|p| p.metadata().is_some() || p.age() >= grace)
        .map(|p| {
            let stability = p
                .metadata()
                .map(|m| m.attnets.count_ones())
                .unwrap_or(0) as f64;
            let mut score = STABILITY_WEIGHT * stability;
            for v in &views {
                if v.mesh.contains(&p.peer_id) {
                    score += MESH_WEIGHT / v.mesh.len() as f64;
                }
                if v.subscribed.contains(&p.peer_id) {
                    score += SUBSCRIBED_WEIGHT / v.subscribed.len() as f64;
                }
            }
            (score, p.clone())
        })
        .collect();

    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored.truncate(excess);
    scored.into_iter().map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::router::TopicMeshStats;
    use crate::switch::Direction;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeRouter {
        stats: Mutex<HashMap<String, TopicMeshStats>>,
        mesh: Mutex<HashMap<String, Vec<PeerId>>>,
        subscribed: Mutex<HashMap<String, Vec<PeerId>>>,
    }

    #[async_trait]
    impl GossipRouter for FakeRouter {
        async fn subscribe(&self, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn publish(&self, _topic: &str, _data: Bytes) -> anyhow::Result<usize> {
            Ok(0)
        }
        fn mesh_stats(&self, topic: &str) -> TopicMeshStats {
            self.stats.lock().get(topic).copied().unwrap_or_default()
        }
        fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
            self.mesh.lock().get(topic).cloned().unwrap_or_default()
        }
        fn subscribed_peers(&self, topic: &str) -> Vec<PeerId> {
            self.subscribed.lock().get(topic).cloned().unwrap_or_default()
        }
        fn downrank(&self, _peer: &PeerId) {}
    }

    fn digest() -> ForkDigest {
        ForkDigest([1, 2, 3, 4])
    }

    fn healthy() -> TopicMeshStats {
        TopicMeshStats {
            topic_peers: 20,
            mesh_peers: 10,
            outbound_mesh_peers: 4,
        }
    }

    #[test]
    fn test_scan_prefers_worst_category() {
        let cfg = NetworkConfig::default();
        let router = FakeRouter::default();
        let mut local = MetaData::default();
        local.attnets.set(3, true);
        local.attnets.set(7, true);
        local.attnets.set(9, true);

        {
            let mut stats = router.stats.lock();
            // Subnet 3: starving outright.
            stats.insert(
                topics::attestation_subnet(digest(), 3).full(),
                TopicMeshStats {
                    topic_peers: 1,
                    mesh_peers: 0,
                    outbound_mesh_peers: 0,
                },
            );
            // Subnet 7: enough topic peers, thin mesh.
            stats.insert(
                topics::attestation_subnet(digest(), 7).full(),
                TopicMeshStats {
                    topic_peers: 10,
                    mesh_peers: 2,
                    outbound_mesh_peers: 2,
                },
            );
            // Subnet 9: healthy.
            stats.insert(topics::attestation_subnet(digest(), 9).full(), healthy());
        }

        let needs = scan_needy_subnets(&router, digest(), &local, &ColnetBits::new(), &cfg);
        // Only the lowOutgoing subnet shows up; belowD is outranked.
        assert!(needs.attnets.get(3));
        assert!(!needs.attnets.get(7));
        assert!(!needs.attnets.get(9));
    }

    #[test]
    fn test_scan_empty_when_healthy() {
        let cfg = NetworkConfig::default();
        let router = FakeRouter::default();
        let mut local = MetaData::default();
        local.attnets.set(0, true);
        router
            .stats
            .lock()
            .insert(topics::attestation_subnet(digest(), 0).full(), healthy());
        let needs = scan_needy_subnets(&router, digest(), &local, &ColnetBits::new(), &cfg);
        assert!(needs.is_empty());
    }

    fn peer(b: u8) -> Arc<Peer> {
        let p = Arc::new(Peer::new(
            PeerId::new([b; 32]),
            Direction::Outgoing,
            4,
            Duration::from_secs(5),
        ));
        p.on_connection_opened(Direction::Outgoing);
        p.mark_connected();
        // Old enough to be trimmable without metadata.
        p.set_metadata(MetaData::default());
        p
    }

    #[test]
    fn test_trim_drops_least_valuable_first() {
        let router = FakeRouter::default();
        let topic = "/eth2/01020304/beacon_attestation_1/ssz_snappy".to_owned();
        let valuable = peer(1);
        let expendable = peer(2);
        router
            .mesh
            .lock()
            .insert(topic.clone(), vec![valuable.peer_id]);

        let peers = vec![valuable.clone(), expendable.clone()];
        let trimmed =
            select_trim_candidates(&peers, &router, &[topic], 1, Duration::from_secs(30));
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].peer_id, expendable.peer_id);
    }

    #[test]
    fn test_trim_never_touches_direct_peers() {
        let router = FakeRouter::default();
        let direct = peer(1);
        direct.mark_direct();
        let peers = vec![direct];
        let trimmed = select_trim_candidates(&peers, &router, &[], 1, Duration::from_secs(30));
        assert!(trimmed.is_empty());
    }

    #[test]
    fn test_trim_grace_for_unknown_metadata() {
        let router = FakeRouter::default();
        let fresh = Arc::new(Peer::new(
            PeerId::new([9; 32]),
            Direction::Incoming,
            4,
            Duration::from_secs(5),
        ));
        fresh.on_connection_opened(Direction::Incoming);
        let peers = vec![fresh];
        let trimmed =
            select_trim_candidates(&peers, &router, &[], 1, Duration::from_secs(3600));
        assert!(trimmed.is_empty());
    }

    #[test]
    fn test_ubiquitous_topics_excluded_from_scoring() {
        let router = FakeRouter::default();
        let topic = "/eth2/01020304/beacon_block/ssz_snappy".to_owned();
        let a = peer(1);
        let b = peer(2);
        let c = peer(3);
        let d = peer(4);
        // All four peers subscribe: > 75% of the pool, so it must not bias.
        router.subscribed.lock().insert(
            topic.clone(),
            vec![a.peer_id, b.peer_id, c.peer_id, d.peer_id],
        );
        let peers = vec![a, b, c, d];
        let trimmed =
            select_trim_candidates(&peers, &router, &[topic], 4, Duration::from_secs(30));
        // Everyone scored identically (zero), so all are equally trimmable.
        assert_eq!(trimmed.len(), 4);
    }
}
