use bitvec::prelude::*;

use crate::constants::{
    ATTESTATION_SUBNET_COUNT, DATA_COLUMN_SIDECAR_SUBNET_COUNT, SYNC_COMMITTEE_SUBNET_COUNT,
};

/// Fixed-width subnet subscription bitfield.
///
/// Bit order matches SSZ Bitvector[N]: least significant bit of byte 0 is
/// subnet 0, so the raw bytes go on the wire and into node records as-is.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SubnetBits<const BYTES: usize> {
    bits: BitArray<[u8; BYTES], Lsb0>,
}

/// Attestation subnets ("attnets"), 64 bits.
pub type AttnetBits = SubnetBits<{ ATTESTATION_SUBNET_COUNT / 8 }>;
/// Sync committee subnets ("syncnets"), 4 bits in one byte.
pub type SyncnetBits = SubnetBits<1>;
/// Data column sidecar subnets, 128 bits.
pub type ColnetBits = SubnetBits<{ DATA_COLUMN_SIDECAR_SUBNET_COUNT / 8 }>;

impl<const BYTES: usize> SubnetBits<BYTES> {
    pub const BIT_COUNT: usize = BYTES * 8;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(b: [u8; BYTES]) -> Self {
        SubnetBits {
            bits: BitArray::new(b),
        }
    }

    pub fn as_bytes(&self) -> [u8; BYTES] {
        self.bits.into_inner()
    }

    pub fn get(&self, subnet: usize) -> bool {
        self.bits.get(subnet).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, subnet: usize, value: bool) {
        if let Some(mut slot) = self.bits.get_mut(subnet) {
            *slot = value;
        }
    }

    pub fn union_with(&mut self, other: &Self) {
        self.bits |= other.bits;
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_zero(&self) -> bool {
        self.bits.not_any()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// True if any subnet is set in both bitfields.
    pub fn intersects(&self, other: &Self) -> bool {
        (self.bits & other.bits).any()
    }
}

impl<const BYTES: usize> std::fmt::Debug for SubnetBits<BYTES> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.as_bytes()))
    }
}

/// Sanity assertion that the sync committee bitfield fits one byte.
const _: () = assert!(SYNC_COMMITTEE_SUBNET_COUNT <= 8);
