use sha2::{Digest, Sha256};

use beaconet_core::constants::MESSAGE_DOMAIN_VALID_SNAPPY;

pub const MESSAGE_ID_LEN: usize = 20;

/// Computes the gossip message id over the *decompressed* payload.
///
/// Post-phase0 topics mix the topic into the hash for domain separation;
/// topics under the phase0 fork-digest prefix keep the legacy rule of
/// hashing the payload alone.
pub fn message_id(
    phase0_topic_prefix: &str,
    topic: &str,
    decompressed: &[u8],
) -> [u8; MESSAGE_ID_LEN] {
    let mut h = Sha256::new();
    h.update(MESSAGE_DOMAIN_VALID_SNAPPY);
    if !topic.starts_with(phase0_topic_prefix) {
        h.update((topic.len() as u64).to_le_bytes());
        h.update(topic.as_bytes());
    }
    h.update(decompressed);
    let digest = h.finalize();
    let mut out = [0u8; MESSAGE_ID_LEN];
    out.copy_from_slice(&digest[..MESSAGE_ID_LEN]);
    out
}
