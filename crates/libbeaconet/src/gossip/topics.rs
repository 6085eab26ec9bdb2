use beaconet_core::ForkDigest;

pub const TOPIC_PREFIX: &str = "/eth2";
pub const TOPIC_ENCODING: &str = "ssz_snappy";

pub const BEACON_BLOCK: &str = "beacon_block";
pub const ATTESTATION_SUBNET_PREFIX: &str = "beacon_attestation_";
pub const SYNC_COMMITTEE_SUBNET_PREFIX: &str = "sync_committee_";
pub const DATA_COLUMN_SUBNET_PREFIX: &str = "data_column_sidecar_";

/// A fully qualified gossip topic: `/eth2/<fork-digest>/<name>/ssz_snappy`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GossipTopic {
    pub fork_digest: ForkDigest,
    pub name: String,
}

impl GossipTopic {
    pub fn new(fork_digest: ForkDigest, name: impl Into<String>) -> GossipTopic {
        GossipTopic {
            fork_digest,
            name: name.into(),
        }
    }

    pub fn full(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            TOPIC_PREFIX, self.fork_digest, self.name, TOPIC_ENCODING
        )
    }

    pub fn parse(s: &str) -> Option<GossipTopic> {
        let rest = s.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
        let (digest_hex, rest) = rest.split_once('/')?;
        let (name, encoding) = rest.rsplit_once('/')?;
        if encoding != TOPIC_ENCODING || name.is_empty() {
            return None;
        }
        let digest = hex::decode(digest_hex).ok()?;
        Some(GossipTopic {
            fork_digest: ForkDigest::from_bytes(&digest).ok()?,
            name: name.to_owned(),
        })
    }

    /// The `(subnet-kind-prefix, index)` for per-subnet topics.
    pub fn subnet(&self) -> Option<(&'static str, usize)> {
        for prefix in [
            ATTESTATION_SUBNET_PREFIX,
            SYNC_COMMITTEE_SUBNET_PREFIX,
            DATA_COLUMN_SUBNET_PREFIX,
        ] {
            if let Some(idx) = self.name.strip_prefix(prefix) {
                return idx.parse().ok().map(|i| (prefix, i));
            }
        }
        None
    }
}

impl std::fmt::Display for GossipTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full())
    }
}

pub fn beacon_block(digest: ForkDigest) -> GossipTopic {
    GossipTopic::new(digest, BEACON_BLOCK)
}

pub fn attestation_subnet(digest: ForkDigest, subnet: usize) -> GossipTopic {
    GossipTopic::new(digest, format!("{ATTESTATION_SUBNET_PREFIX}{subnet}"))
}

pub fn sync_committee_subnet(digest: ForkDigest, subnet: usize) -> GossipTopic {
    GossipTopic::new(digest, format!("{SYNC_COMMITTEE_SUBNET_PREFIX}{subnet}"))
}

pub fn data_column_subnet(digest: ForkDigest, subnet: usize) -> GossipTopic {
    GossipTopic::new(digest, format!("{DATA_COLUMN_SUBNET_PREFIX}{subnet}"))
}
