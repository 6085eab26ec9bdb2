use beaconet_core::constants::MAX_PAYLOAD_SIZE;
use beaconet_core::fork::MetadataVersion;
use beaconet_core::metadata::MetaData;

pub const PROTOCOL_PREFIX: &str = "/eth2/beacon_chain/req";
pub const PROTOCOL_SUFFIX: &str = "ssz_snappy";

const MAX_REQUEST_BLOCKS: u64 = 1024;
const MAX_REQUEST_BLOB_SIDECARS: u64 = 768;
const MAX_REQUEST_DATA_COLUMN_SIDECARS: u64 = 16384;

/// Inclusive SSZ size bounds for one payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeBounds {
    pub min: usize,
    pub max: usize,
}

const fn bounds(min: usize, max: usize) -> SizeBounds {
    SizeBounds { min, max }
}

/// Descriptor of one Req/Resp message type: protocol naming, payload size
/// bounds, response stream shape. Payload schemas themselves stay opaque.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Status,
    Goodbye,
    Ping,
    MetadataV1,
    MetadataV2,
    MetadataV3,
    BlocksByRange,
    BlocksByRoot,
    BlobsByRange,
    BlobsByRoot,
    ColumnsByRange,
    ColumnsByRoot,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Status,
        MessageKind::Goodbye,
        MessageKind::Ping,
        MessageKind::MetadataV1,
        MessageKind::MetadataV2,
        MessageKind::MetadataV3,
        MessageKind::BlocksByRange,
        MessageKind::BlocksByRoot,
        MessageKind::BlobsByRange,
        MessageKind::BlobsByRoot,
        MessageKind::ColumnsByRange,
        MessageKind::ColumnsByRoot,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Status => "status",
            MessageKind::Goodbye => "goodbye",
            MessageKind::Ping => "ping",
            MessageKind::MetadataV1 | MessageKind::MetadataV2 | MessageKind::MetadataV3 => {
                "metadata"
            }
            MessageKind::BlocksByRange => "beacon_blocks_by_range",
            MessageKind::BlocksByRoot => "beacon_blocks_by_root",
            MessageKind::BlobsByRange => "blob_sidecars_by_range",
            MessageKind::BlobsByRoot => "blob_sidecars_by_root",
            MessageKind::ColumnsByRange => "data_column_sidecars_by_range",
            MessageKind::ColumnsByRoot => "data_column_sidecars_by_root",
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            MessageKind::MetadataV2 => 2,
            MessageKind::MetadataV3 => 3,
            MessageKind::BlocksByRange | MessageKind::BlocksByRoot => 2,
            _ => 1,
        }
    }

    /// Short tag for metrics and throttle counters.
    pub fn short_id(&self) -> &'static str {
        match self {
            MessageKind::Status => "status",
            MessageKind::Goodbye => "goodbye",
            MessageKind::Ping => "ping",
            MessageKind::MetadataV1 | MessageKind::MetadataV2 | MessageKind::MetadataV3 => {
                "metadata"
            }
            MessageKind::BlocksByRange => "blocks_range",
            MessageKind::BlocksByRoot => "blocks_root",
            MessageKind::BlobsByRange => "blobs_range",
            MessageKind::BlobsByRoot => "blobs_root",
            MessageKind::ColumnsByRange => "columns_range",
            MessageKind::ColumnsByRoot => "columns_root",
        }
    }

    /// `/eth2/beacon_chain/req/<name>/<version>/ssz_snappy`
    pub fn protocol_id(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            PROTOCOL_PREFIX,
            self.name(),
            self.version(),
            PROTOCOL_SUFFIX
        )
    }

    pub fn from_protocol_id(id: &str) -> Option<MessageKind> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|k| k.protocol_id() == id)
    }

    /// Metadata requests have zero SSZ size; the request chunk is omitted
    /// entirely.
    pub fn request_is_empty(&self) -> bool {
        self.request_bounds().max == 0
    }

    pub fn request_bounds(&self) -> SizeBounds {
        match self {
            // Pre- and post-Fulu status payloads.
            MessageKind::Status => bounds(84, 92),
            MessageKind::Goodbye | MessageKind::Ping => bounds(8, 8),
            MessageKind::MetadataV1 | MessageKind::MetadataV2 | MessageKind::MetadataV3 => {
                bounds(0, 0)
            }
            MessageKind::BlocksByRange => bounds(24, 24),
            MessageKind::BlocksByRoot => bounds(32, 32 * MAX_REQUEST_BLOCKS as usize),
            MessageKind::BlobsByRange => bounds(16, 16),
            MessageKind::BlobsByRoot => bounds(40, 40 * MAX_REQUEST_BLOB_SIDECARS as usize),
            MessageKind::ColumnsByRange => bounds(16, 16 + 8 * 128),
            MessageKind::ColumnsByRoot => bounds(36, 64 * 1024),
        }
    }

    pub fn response_bounds(&self) -> SizeBounds {
        match self {
            MessageKind::Status => bounds(84, 92),
            MessageKind::Goodbye | MessageKind::Ping => bounds(8, 8),
            MessageKind::MetadataV1 => {
                let n = MetaData::ssz_len(MetadataVersion::V1);
                bounds(n, n)
            }
            MessageKind::MetadataV2 => {
                let n = MetaData::ssz_len(MetadataVersion::V2);
                bounds(n, n)
            }
            MessageKind::MetadataV3 => {
                let n = MetaData::ssz_len(MetadataVersion::V3);
                bounds(n, n)
            }
            _ => bounds(1, MAX_PAYLOAD_SIZE),
        }
    }

    /// Whether Success response chunks carry the 4-byte fork-digest context.
    pub fn response_has_context(&self) -> bool {
        matches!(
            self,
            MessageKind::BlocksByRange
                | MessageKind::BlocksByRoot
                | MessageKind::BlobsByRange
                | MessageKind::BlobsByRoot
                | MessageKind::ColumnsByRange
                | MessageKind::ColumnsByRoot
        )
    }

    /// List responses stream chunks until clean EOF; single responses read
    /// exactly one chunk.
    pub fn is_list_response(&self) -> bool {
        self.max_response_chunks() > 1
    }

    pub fn max_response_chunks(&self) -> u64 {
        match self {
            MessageKind::BlocksByRange | MessageKind::BlocksByRoot => MAX_REQUEST_BLOCKS,
            MessageKind::BlobsByRange | MessageKind::BlobsByRoot => MAX_REQUEST_BLOB_SIDECARS,
            MessageKind::ColumnsByRange | MessageKind::ColumnsByRoot => {
                MAX_REQUEST_DATA_COLUMN_SIDECARS
            }
            _ => 1,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name(), self.version())
    }
}
