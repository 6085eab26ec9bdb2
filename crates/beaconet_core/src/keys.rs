use rand::RngCore;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use zeroize::Zeroizing;

use crate::peer_id::PeerId;

pub const SEED_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// The node's long-term Ed25519 network identity.
pub struct NetworkKeypair {
    keypair: Ed25519KeyPair,
    seed: Zeroizing<[u8; SEED_LEN]>,
    peer_id: PeerId,
}

impl NetworkKeypair {
    pub fn generate() -> NetworkKeypair {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        rand::rng().fill_bytes(&mut seed[..]);
        Self::from_seed(&seed).expect("freshly generated seed is valid")
    }

    pub fn from_seed(seed: &[u8; SEED_LEN]) -> anyhow::Result<NetworkKeypair> {
        let keypair = Ed25519KeyPair::from_seed_unchecked(seed)
            .map_err(|e| anyhow::anyhow!("invalid ed25519 seed: {e}"))?;
        let peer_id = PeerId::from_public_key(keypair.public_key().as_ref());
        Ok(NetworkKeypair {
            keypair,
            seed: Zeroizing::new(*seed),
            peer_id,
        })
    }

    pub fn seed(&self) -> &[u8; SEED_LEN] {
        &self.seed
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(self.keypair.public_key().as_ref());
        out
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(self.keypair.sign(message).as_ref());
        out
    }
}

pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(message, signature)
        .is_ok()
}

impl std::fmt::Debug for NetworkKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkKeypair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
