// Req/Resp wire protocol: chunk framing, response codes, error taxonomy.
//
// A chunk is `[response-code]? ‖ [context-bytes]? ‖ LEB128(uncompressed-len)
// ‖ framed-snappy(payload)`. This crate knows nothing about payload schemas
// beyond per-message size bounds; payloads are opaque bytes.

mod chunk;
mod message;
mod snappy_framed;
mod varint;

pub use chunk::{
    read_request, read_response_chunk, render_error_message, write_error_response, write_request,
    write_response_chunk, ResponseChunk,
};
pub use message::{MessageKind, PROTOCOL_PREFIX, PROTOCOL_SUFFIX};
pub use snappy_framed::{framed_compress, framed_decompress};
pub use varint::{read_uvarint, write_uvarint, MAX_UVARINT_LEN};

/// Response code prefixing every response chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0,
    InvalidRequest = 1,
    ServerError = 2,
    ResourceUnavailable = 3,
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Option<ResponseCode> {
        match v {
            0 => Some(ResponseCode::Success),
            1 => Some(ResponseCode::InvalidRequest),
            2 => Some(ResponseCode::ServerError),
            3 => Some(ResponseCode::ResourceUnavailable),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResponseCode::Success => "success",
            ResponseCode::InvalidRequest => "invalid request",
            ResponseCode::ServerError => "server error",
            ResponseCode::ResourceUnavailable => "resource unavailable",
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Goodbye reason codes. Values >= 128 are implementation-private.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum GoodbyeReason {
    ClientShutDown = 1,
    IrrelevantNetwork = 2,
    FaultOrError = 3,
    /// Implementation-private: trimmed to make room, reconnect later is fine.
    TooManyPeers = 129,
    PeerScoreLow = 237,
}

impl GoodbyeReason {
    pub fn from_code(code: u64) -> Option<GoodbyeReason> {
        match code {
            1 => Some(GoodbyeReason::ClientShutDown),
            2 => Some(GoodbyeReason::IrrelevantNetwork),
            3 => Some(GoodbyeReason::FaultOrError),
            129 => Some(GoodbyeReason::TooManyPeers),
            237 => Some(GoodbyeReason::PeerScoreLow),
            _ => None,
        }
    }

    pub fn code(&self) -> u64 {
        *self as u64
    }
}

/// Everything that can go wrong transferring one Req/Resp interaction.
///
/// Kinds from `InvalidResponseCode` down are protocol violations by the
/// remote; the ones above are benign transport failures.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("connection broken: {0}")]
    BrokenConnection(#[source] std::io::Error),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("end of stream at a chunk boundary")]
    PotentiallyExpectedEof,
    #[error("timed out opening stream")]
    StreamOpenTimeout,
    #[error("timed out reading response chunk")]
    ReadResponseTimeout,
    #[error("invalid response code {0}")]
    InvalidResponseCode(u8),
    #[error("invalid snappy framing: {0}")]
    InvalidSnappyBytes(&'static str),
    #[error("invalid ssz payload")]
    InvalidSszBytes,
    #[error("invalid size prefix {declared} (bounds {min}..={max})")]
    InvalidSizePrefix {
        declared: u64,
        min: usize,
        max: usize,
    },
    #[error("zero size prefix for a non-empty message")]
    ZeroSizePrefix,
    #[error("size prefix {declared} exceeds maximum {max}")]
    SizePrefixOverflow { declared: u64, max: usize },
    #[error("unrecognized context bytes {}", hex::encode(.0))]
    InvalidContextBytes([u8; 4]),
    #[error("response exceeded {max_chunks} chunks")]
    ResponseChunkOverflow { max_chunks: u64 },
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("peer responded {code}: {message}")]
    ReceivedErrorResponse { code: ResponseCode, message: String },
}

impl RpcError {
    /// Protocol violations warrant heavy descoring; benign transport errors
    /// do not.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(
            self,
            RpcError::BrokenConnection(_)
                | RpcError::UnexpectedEof
                | RpcError::PotentiallyExpectedEof
                | RpcError::StreamOpenTimeout
                | RpcError::ReadResponseTimeout
                | RpcError::ReceivedErrorResponse { .. }
        )
    }

    /// Maps an io error from a read to the right kind: clean EOF means the
    /// remote half-closed, anything else means the connection broke.
    pub fn from_read_io(e: std::io::Error) -> RpcError {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::UnexpectedEof
        } else {
            RpcError::BrokenConnection(e)
        }
    }

    pub fn from_write_io(e: std::io::Error) -> RpcError {
        RpcError::BrokenConnection(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_roundtrip() {
        for v in 0..=3u8 {
            assert_eq!(ResponseCode::from_u8(v).unwrap() as u8, v);
        }
        assert!(ResponseCode::from_u8(4).is_none());
        assert!(ResponseCode::from_u8(255).is_none());
    }

    #[test]
    fn test_goodbye_codes() {
        assert_eq!(GoodbyeReason::PeerScoreLow.code(), 237);
        assert_eq!(
            GoodbyeReason::from_code(2),
            Some(GoodbyeReason::IrrelevantNetwork)
        );
        assert_eq!(GoodbyeReason::from_code(128), None);
    }

    #[test]
    fn test_violation_split() {
        assert!(!RpcError::UnexpectedEof.is_protocol_violation());
        assert!(!RpcError::StreamOpenTimeout.is_protocol_violation());
        assert!(!RpcError::ReceivedErrorResponse {
            code: ResponseCode::ServerError,
            message: "x".into()
        }
        .is_protocol_violation());
        assert!(RpcError::InvalidResponseCode(9).is_protocol_violation());
        assert!(RpcError::ZeroSizePrefix.is_protocol_violation());
        assert!(RpcError::InvalidSnappyBytes("x").is_protocol_violation());
    }
}
