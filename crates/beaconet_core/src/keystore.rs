use std::path::{Path, PathBuf};

use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::keys::{NetworkKeypair, SEED_LEN};

/// Well-known password for throwaway/dev networks. Anything protected with it
/// must be treated as public.
pub const INSECURE_PASSWORD: &str = "INSECUREPASSWORD";

/// Key file path sentinel producing a fresh in-memory key, nothing persisted.
pub const RANDOM_KEY_PATH: &str = "random";

const KEYSTORE_VERSION: u32 = 1;
const SALT_LEN: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum KeystoreError {
    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed keystore {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported keystore version {0}")]
    UnsupportedVersion(u32),
    #[error("wrong password or corrupt keystore")]
    WrongPassword,
    #[error("keystore field {0} has wrong length")]
    FieldLength(&'static str),
    #[error("decrypted seed is not a valid key: {0}")]
    InvalidSeed(String),
}

#[derive(Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    public_key: String,
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut h = Sha256::new();
    h.update(password.as_bytes());
    h.update(salt);
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&h.finalize());
    out
}

fn aead_key(password: &str, salt: &[u8]) -> LessSafeKey {
    let key = derive_key(password, salt);
    LessSafeKey::new(
        UnboundKey::new(&CHACHA20_POLY1305, &key[..]).expect("chacha20-poly1305 key is 32 bytes"),
    )
}

pub fn save(path: &Path, keypair: &NetworkKeypair, password: &str) -> Result<(), KeystoreError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut nonce);

    let mut sealed = keypair.seed().to_vec();
    aead_key(password, &salt)
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut sealed,
        )
        .expect("sealing cannot fail for a 32-byte seed");

    let file = KeystoreFile {
        version: KEYSTORE_VERSION,
        public_key: hex::encode(keypair.public_key()),
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(&sealed),
    };
    let json = serde_json::to_string_pretty(&file).expect("keystore file serializes");
    std::fs::write(path, json).map_err(|source| KeystoreError::Write {
        path: path.to_owned(),
        source,
    })
}

pub fn load(path: &Path, password: &str) -> Result<NetworkKeypair, KeystoreError> {
    let raw = std::fs::read(path).map_err(|source| KeystoreError::Read {
        path: path.to_owned(),
        source,
    })?;
    let file: KeystoreFile =
        serde_json::from_slice(&raw).map_err(|source| KeystoreError::Malformed {
            path: path.to_owned(),
            source,
        })?;
    if file.version != KEYSTORE_VERSION {
        return Err(KeystoreError::UnsupportedVersion(file.version));
    }

    let salt = hex::decode(&file.salt).map_err(|_| KeystoreError::FieldLength("salt"))?;
    let nonce: [u8; NONCE_LEN] = hex::decode(&file.nonce)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or(KeystoreError::FieldLength("nonce"))?;
    let mut sealed =
        hex::decode(&file.ciphertext).map_err(|_| KeystoreError::FieldLength("ciphertext"))?;

    let plain = aead_key(password, &salt)
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
        .map_err(|_| KeystoreError::WrongPassword)?;

    let seed: [u8; SEED_LEN] = plain
        .try_into()
        .map_err(|_| KeystoreError::FieldLength("seed"))?;
    NetworkKeypair::from_seed(&seed).map_err(|e| KeystoreError::InvalidSeed(format!("{e:#}")))
}

/// Resolves the configured key path and loads the network key, creating and
/// persisting a new one on first run. `"random"` yields an ephemeral key.
pub fn load_or_create(
    key_path: &str,
    data_dir: &Path,
    password: &str,
) -> Result<NetworkKeypair, KeystoreError> {
    if key_path == RANDOM_KEY_PATH {
        let kp = NetworkKeypair::generate();
        info!(peer_id = %kp.peer_id(), "using ephemeral network key");
        return Ok(kp);
    }
    let path = if Path::new(key_path).is_absolute() {
        PathBuf::from(key_path)
    } else {
        data_dir.join(key_path)
    };
    if path.exists() {
        let kp = load(&path, password)?;
        info!(peer_id = %kp.peer_id(), path = %path.display(), "loaded network key");
        return Ok(kp);
    }
    if password == INSECURE_PASSWORD {
        warn!(path = %path.display(), "protecting network key with the insecure well-known password");
    }
    let kp = NetworkKeypair::generate();
    save(&path, &kp, password)?;
    info!(peer_id = %kp.peer_id(), path = %path.display(), "generated new network key");
    Ok(kp)
}
