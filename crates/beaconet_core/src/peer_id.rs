use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Stable peer identifier: SHA-256 of the peer's long-term Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn new(from: [u8; 32]) -> PeerId {
        PeerId(from)
    }

    pub fn from_public_key(public_key: &[u8]) -> PeerId {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(public_key));
        PeerId(out)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        let mut v = [0u8; 32];
        if b.len() != 32 {
            anyhow::bail!("peer id must be 32 bytes, got {}", b.len());
        }
        v.copy_from_slice(b);
        Ok(PeerId(v))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for logs: first 4 bytes of hex.
    pub fn short(&self) -> String {
        format!("{}…", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        if s.len() != 64 {
            anyhow::bail!("expected a hex string of length 64, got {}", s.len());
        }
        hex::decode_to_slice(s, &mut out)?;
        Ok(PeerId(out))
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PeerId::from_str(&s).map_err(serde::de::Error::custom)
    }
}
