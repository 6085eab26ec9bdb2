use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::fork::MetadataVersion;
use crate::subnets::{AttnetBits, SyncnetBits};

/// Node metadata exchanged over the `metadata` Req/Resp protocol and
/// advertised (partially) in the node record.
///
/// The wire layout is the SSZ fixed container; fields appended by newer
/// forks are widened to zero when decoding older versions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetaData {
    pub seq_number: u64,
    #[serde(skip)]
    pub attnets: AttnetBits,
    #[serde(skip)]
    pub syncnets: SyncnetBits,
    pub custody_subnet_count: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum MetadataDecodeError {
    #[error("metadata {version:?} must be {expected} bytes, got {got}")]
    WrongLength {
        version: MetadataVersion,
        expected: usize,
        got: usize,
    },
}

const V1_LEN: usize = 8 + 8;
const V2_LEN: usize = V1_LEN + 1;
const V3_LEN: usize = V2_LEN + 8;

impl MetaData {
    pub const fn ssz_len(version: MetadataVersion) -> usize {
        match version {
            MetadataVersion::V1 => V1_LEN,
            MetadataVersion::V2 => V2_LEN,
            MetadataVersion::V3 => V3_LEN,
        }
    }

    pub fn ssz_encode(&self, version: MetadataVersion) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::ssz_len(version));
        out.put_u64_le(self.seq_number);
        out.put_slice(&self.attnets.as_bytes());
        if version >= MetadataVersion::V2 {
            out.put_slice(&self.syncnets.as_bytes());
        }
        if version >= MetadataVersion::V3 {
            out.put_u64_le(self.custody_subnet_count);
        }
        out.freeze()
    }

    pub fn ssz_decode(version: MetadataVersion, b: &[u8]) -> Result<MetaData, MetadataDecodeError> {
        let expected = Self::ssz_len(version);
        if b.len() != expected {
            return Err(MetadataDecodeError::WrongLength {
                version,
                expected,
                got: b.len(),
            });
        }
        let seq_number = u64::from_le_bytes(b[0..8].try_into().unwrap());
        let attnets = AttnetBits::from_bytes(b[8..16].try_into().unwrap());
        let mut md = MetaData {
            seq_number,
            attnets,
            ..Default::default()
        };
        if version >= MetadataVersion::V2 {
            md.syncnets = SyncnetBits::from_bytes([b[16]]);
        }
        if version >= MetadataVersion::V3 {
            md.custody_subnet_count = u64::from_le_bytes(b[17..25].try_into().unwrap());
        }
        Ok(md)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetaData {
        let mut attnets = AttnetBits::new();
        attnets.set(3, true);
        attnets.set(63, true);
        let mut syncnets = SyncnetBits::new();
        syncnets.set(1, true);
        MetaData {
            seq_number: 42,
            attnets,
            syncnets,
            custody_subnet_count: 4,
        }
    }

    #[test]
    fn test_lengths() {
        let md = sample();
        assert_eq!(md.ssz_encode(MetadataVersion::V1).len(), 16);
        assert_eq!(md.ssz_encode(MetadataVersion::V2).len(), 17);
        assert_eq!(md.ssz_encode(MetadataVersion::V3).len(), 25);
    }

    #[test]
    fn test_roundtrip_v3() {
        let md = sample();
        let enc = md.ssz_encode(MetadataVersion::V3);
        let dec = MetaData::ssz_decode(MetadataVersion::V3, &enc).unwrap();
        assert_eq!(md, dec);
    }

    #[test]
    fn test_old_version_widens_with_zero_fields() {
        let md = sample();
        let enc = md.ssz_encode(MetadataVersion::V1);
        let dec = MetaData::ssz_decode(MetadataVersion::V1, &enc).unwrap();
        assert_eq!(dec.seq_number, md.seq_number);
        assert_eq!(dec.attnets, md.attnets);
        assert!(dec.syncnets.is_zero());
        assert_eq!(dec.custody_subnet_count, 0);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let md = sample();
        let enc = md.ssz_encode(MetadataVersion::V2);
        assert!(MetaData::ssz_decode(MetadataVersion::V3, &enc).is_err());
        assert!(MetaData::ssz_decode(MetadataVersion::V1, &enc).is_err());
    }
}
