use serde::Serialize;
use sha2::{Digest, Sha256};

pub type Epoch = u64;

/// First 4 bytes of sha256(fork_version ‖ genesis_validators_root).
/// Identifies a chain+fork; used as gossip topic prefix and Req/Resp
/// context bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ForkDigest(pub [u8; 4]);

impl ForkDigest {
    pub fn compute(fork_version: [u8; 4], genesis_validators_root: [u8; 32]) -> ForkDigest {
        let mut h = Sha256::new();
        h.update(fork_version);
        h.update(genesis_validators_root);
        let digest = h.finalize();
        ForkDigest([digest[0], digest[1], digest[2], digest[3]])
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<ForkDigest> {
        if b.len() != 4 {
            anyhow::bail!("fork digest must be 4 bytes, got {}", b.len());
        }
        Ok(ForkDigest([b[0], b[1], b[2], b[3]]))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for ForkDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl std::fmt::Display for ForkDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// Which metadata response version a fork speaks. Newer forks append fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetadataVersion {
    V1,
    V2,
    V3,
}

#[derive(Clone, Debug)]
pub struct ForkEntry {
    pub epoch: Epoch,
    pub digest: ForkDigest,
    pub metadata_version: MetadataVersion,
}

/// Ordered fork activation table, first entry is phase0 (epoch 0).
#[derive(Clone, Debug)]
pub struct ForkSchedule {
    entries: Vec<ForkEntry>,
}

impl ForkSchedule {
    /// Entries must be sorted by activation epoch and start at epoch 0.
    pub fn new(entries: Vec<ForkEntry>) -> anyhow::Result<ForkSchedule> {
        if entries.is_empty() {
            anyhow::bail!("fork schedule cannot be empty");
        }
        if entries[0].epoch != 0 {
            anyhow::bail!("first fork must activate at epoch 0");
        }
        if !entries.windows(2).all(|w| w[0].epoch < w[1].epoch) {
            anyhow::bail!("fork epochs must be strictly increasing");
        }
        Ok(ForkSchedule { entries })
    }

    pub fn phase0_digest(&self) -> ForkDigest {
        self.entries[0].digest
    }

    pub fn entry_at_epoch(&self, epoch: Epoch) -> &ForkEntry {
        self.entries
            .iter()
            .rev()
            .find(|e| e.epoch <= epoch)
            .expect("first entry activates at epoch 0")
    }

    pub fn digest_at_epoch(&self, epoch: Epoch) -> ForkDigest {
        self.entry_at_epoch(epoch).digest
    }

    pub fn metadata_version_at_epoch(&self, epoch: Epoch) -> MetadataVersion {
        self.entry_at_epoch(epoch).metadata_version
    }

    /// Reverse lookup used to validate received context bytes.
    pub fn entry_for_digest(&self, digest: ForkDigest) -> Option<&ForkEntry> {
        self.entries.iter().find(|e| e.digest == digest)
    }

    pub fn digests(&self) -> impl Iterator<Item = ForkDigest> + '_ {
        self.entries.iter().map(|e| e.digest)
    }
}
