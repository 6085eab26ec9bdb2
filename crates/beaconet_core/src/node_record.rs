use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::keys::{verify_signature, NetworkKeypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::peer_id::PeerId;
use crate::subnets::{AttnetBits, SyncnetBits};

/// One dialable endpoint of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Multiaddress {
    Tcp(SocketAddr),
    Udp(SocketAddr),
}

impl Multiaddress {
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            Multiaddress::Tcp(a) | Multiaddress::Udp(a) => *a,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Multiaddress::Tcp(_))
    }
}

/// Dial target produced from node records or direct-peer configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddress>,
}

/// Signed, versioned record of a node's identity and capabilities.
///
/// Field mutations go through [`NodeRecord::update`], which bumps the
/// sequence number and re-signs only when the content actually changed.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub seq: u64,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],

    pub tcp4: Option<SocketAddr>,
    pub tcp6: Option<SocketAddr>,
    pub udp4: Option<SocketAddr>,
    pub udp6: Option<SocketAddr>,

    /// SSZ-encoded fork id ("eth2" key).
    pub eth2: Bytes,
    pub attnets: AttnetBits,
    pub syncnets: SyncnetBits,
    /// Custody subnet count ("csc" key).
    pub csc: u64,
}

fn put_addr(out: &mut BytesMut, key: u8, addr: Option<SocketAddr>) {
    if let Some(addr) = addr {
        out.put_u8(key);
        let s = addr.to_string();
        out.put_u16_le(s.len() as u16);
        out.put_slice(s.as_bytes());
    }
}

impl NodeRecord {
    pub fn new(keypair: &NetworkKeypair) -> NodeRecord {
        let mut record = NodeRecord {
            seq: 0,
            public_key: keypair.public_key(),
            signature: [0u8; SIGNATURE_LEN],
            tcp4: None,
            tcp6: None,
            udp4: None,
            udp6: None,
            eth2: Bytes::new(),
            attnets: AttnetBits::new(),
            syncnets: SyncnetBits::new(),
            csc: 0,
        };
        record.seq = 1;
        record.signature = keypair.sign(&record.signed_content());
        record
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }

    /// Deterministic encoding of everything covered by the signature.
    fn signed_content(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u64_le(self.seq);
        out.put_slice(&self.public_key);
        put_addr(&mut out, b'4', self.tcp4);
        put_addr(&mut out, b'6', self.tcp6);
        put_addr(&mut out, b'u', self.udp4);
        put_addr(&mut out, b'U', self.udp6);
        out.put_u16_le(self.eth2.len() as u16);
        out.put_slice(&self.eth2);
        out.put_slice(&self.attnets.as_bytes());
        out.put_slice(&self.syncnets.as_bytes());
        out.put_u64_le(self.csc);
        out.freeze()
    }

    pub fn verify(&self) -> bool {
        verify_signature(&self.public_key, &self.signed_content(), &self.signature)
    }

    /// Applies `f`; if it changed the observable content, bumps `seq` and
    /// re-signs. Returns whether a bump happened.
    pub fn update(&mut self, keypair: &NetworkKeypair, f: impl FnOnce(&mut NodeRecord)) -> bool {
        let before = self.signed_content();
        f(self);
        if self.signed_content() == before {
            return false;
        }
        self.seq += 1;
        self.signature = keypair.sign(&self.signed_content());
        true
    }

    /// Dial addresses, TCP variants first.
    pub fn peer_address(&self) -> PeerAddress {
        let mut addresses = Vec::new();
        for a in [self.tcp4, self.tcp6] {
            if let Some(a) = a {
                addresses.push(Multiaddress::Tcp(a));
            }
        }
        for a in [self.udp4, self.udp6] {
            if let Some(a) = a {
                addresses.push(Multiaddress::Udp(a));
            }
        }
        PeerAddress {
            peer_id: self.peer_id(),
            addresses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_record_verifies() {
        let kp = NetworkKeypair::generate();
        let record = NodeRecord::new(&kp);
        assert_eq!(record.seq, 1);
        assert!(record.verify());
        assert_eq!(record.peer_id(), kp.peer_id());
    }

    #[test]
    fn test_update_bumps_seq_and_resigns() {
        let kp = NetworkKeypair::generate();
        let mut record = NodeRecord::new(&kp);

        let changed = record.update(&kp, |r| {
            let mut attnets = AttnetBits::new();
            attnets.set(5, true);
            r.attnets = attnets;
        });
        assert!(changed);
        assert_eq!(record.seq, 2);
        assert!(record.verify());

        // No-op update must not bump.
        let changed = record.update(&kp, |_| {});
        assert!(!changed);
        assert_eq!(record.seq, 2);
    }

    #[test]
    fn test_tampered_record_fails_verification() {
        let kp = NetworkKeypair::generate();
        let mut record = NodeRecord::new(&kp);
        record.csc = 8;
        assert!(!record.verify());
    }

    #[test]
    fn test_peer_address_prefers_tcp() {
        let kp = NetworkKeypair::generate();
        let mut record = NodeRecord::new(&kp);
        record.update(&kp, |r| {
            r.udp4 = Some("10.0.0.1:9000".parse().unwrap());
            r.tcp4 = Some("10.0.0.1:9001".parse().unwrap());
        });
        let addr = record.peer_address();
        assert!(addr.addresses[0].is_tcp());
        assert_eq!(addr.addresses.len(), 2);
    }
}
