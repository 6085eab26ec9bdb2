use std::time::Duration;

use beaconet_core::node_record::PeerAddress;

/// Immutable snapshot of networking knobs, taken at construction.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Peer count the maintenance loops steer toward.
    pub target_peers: usize,
    /// Hard cap; the pool rejects admissions past it.
    pub max_peers: usize,

    pub dial_queue_size: usize,
    pub concurrent_dials: usize,
    pub connect_timeout: Duration,

    pub stream_open_timeout: Duration,
    /// Per-chunk read timeout, restarted on each new chunk.
    pub resp_timeout: Duration,

    /// Per-peer request bucket capacity, replenished fully over
    /// `full_replenish_time`. The global bucket holds twice this.
    pub max_requests_per_peer: usize,
    pub full_replenish_time: Duration,

    pub metadata_request_frequency: Duration,
    pub metadata_max_failures: u32,

    pub mesh_interval: Duration,
    pub discovery_interval: Duration,
    /// Peers without known metadata are exempt from trimming this long.
    pub new_peer_grace: Duration,

    pub gossip_d: usize,
    pub gossip_d_low: usize,
    pub gossip_d_high: usize,
    pub gossip_d_out: usize,

    /// Configured peers: dialed at startup, never trimmed, admission not
    /// score-gated.
    pub direct_peers: Vec<PeerAddress>,

    pub shutdown_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            target_peers: 160,
            max_peers: 176,
            dial_queue_size: 512,
            concurrent_dials: 20,
            connect_timeout: Duration::from_secs(60),
            stream_open_timeout: Duration::from_secs(10),
            resp_timeout: Duration::from_secs(10),
            max_requests_per_peer: 40,
            full_replenish_time: Duration::from_secs(5),
            metadata_request_frequency: Duration::from_secs(30 * 60),
            metadata_max_failures: 3,
            mesh_interval: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(15),
            new_peer_grace: Duration::from_secs(30),
            gossip_d: 8,
            gossip_d_low: 6,
            gossip_d_high: 12,
            gossip_d_out: 2,
            direct_peers: Vec::new(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
