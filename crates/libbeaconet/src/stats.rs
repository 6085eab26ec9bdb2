use serde::Serialize;

/// Point-in-time introspection snapshot, cheap enough to serve on demand.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NetworkStats {
    pub peers: usize,
    pub peers_incoming: usize,
    pub peers_outgoing: usize,
    pub peers_connected: usize,

    pub seen_entries: usize,
    pub pending_dials: usize,

    pub dials_ok: u64,
    pub dials_timeout: u64,
    pub dials_failed: u64,
    pub dials_skipped: u64,

    /// (short protocol id, throttled request count)
    pub throttled: Vec<(String, u64)>,

    pub gossip_failed_snappy: u64,
    pub gossip_failed_ssz: u64,

    pub metadata_seq: u64,
}
