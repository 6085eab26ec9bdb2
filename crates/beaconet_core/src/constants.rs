//! Wire-level constants shared between the codec and the network layer.

/// Upper bound for any uncompressed Req/Resp payload or gossip message.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Same bound applied to outgoing gossip; exceeding it is a programming error.
pub const GOSSIP_MAX_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Error messages in failure response chunks are SSZ List[byte, 256].
pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

/// 4-byte domain prefixing gossip message-id hashing ("valid snappy").
pub const MESSAGE_DOMAIN_VALID_SNAPPY: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

pub const ATTESTATION_SUBNET_COUNT: usize = 64;
pub const SYNC_COMMITTEE_SUBNET_COUNT: usize = 4;
pub const DATA_COLUMN_SIDECAR_SUBNET_COUNT: usize = 128;
