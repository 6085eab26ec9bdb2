use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use beaconet_core::constants::MAX_ERROR_MESSAGE_LEN;

use crate::message::{MessageKind, SizeBounds};
use crate::snappy_framed::{framed_compress, framed_decompress};
use crate::varint::{read_uvarint, write_uvarint};
use crate::{ResponseCode, RpcError};

/// One decoded Success chunk from a response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseChunk {
    /// Raw context bytes for fork-polymorphic message types; validation
    /// against the fork schedule is the caller's job.
    pub context: Option<[u8; 4]>,
    pub payload: Bytes,
}

fn check_size_prefix(declared: u64, b: SizeBounds) -> Result<usize, RpcError> {
    if declared == 0 && b.min > 0 {
        return Err(RpcError::ZeroSizePrefix);
    }
    if declared > b.max as u64 {
        return Err(RpcError::SizePrefixOverflow {
            declared,
            max: b.max,
        });
    }
    if (declared as usize) < b.min {
        return Err(RpcError::InvalidSizePrefix {
            declared,
            min: b.min,
            max: b.max,
        });
    }
    Ok(declared as usize)
}

fn encode_body(payload: &[u8], out: &mut Vec<u8>) {
    write_uvarint(payload.len() as u64, out);
    out.extend_from_slice(&framed_compress(payload));
}

/// Writes a request chunk as one contiguous buffer. Zero-size request types
/// (and only those) write nothing; end-of-request is signalled by the
/// caller's half-close.
pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: MessageKind,
    payload: &[u8],
) -> Result<(), RpcError> {
    if kind.request_is_empty() {
        return Ok(());
    }
    let mut buf = Vec::with_capacity(payload.len() / 2 + 32);
    encode_body(payload, &mut buf);
    w.write_all(&buf).await.map_err(RpcError::from_write_io)
}

/// Writes one Success chunk, with context bytes when the message type
/// carries them.
pub async fn write_response_chunk<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: MessageKind,
    context: Option<[u8; 4]>,
    payload: &[u8],
) -> Result<(), RpcError> {
    debug_assert_eq!(kind.response_has_context(), context.is_some());
    let mut buf = Vec::with_capacity(payload.len() / 2 + 48);
    buf.push(ResponseCode::Success as u8);
    if let Some(ctx) = context {
        buf.extend_from_slice(&ctx);
    }
    encode_body(payload, &mut buf);
    w.write_all(&buf).await.map_err(RpcError::from_write_io)
}

/// Writes a failure response chunk carrying a bounded error message.
pub async fn write_error_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: ResponseCode,
    message: &[u8],
) -> Result<(), RpcError> {
    debug_assert_ne!(code, ResponseCode::Success);
    let message = &message[..message.len().min(MAX_ERROR_MESSAGE_LEN)];
    let mut buf = Vec::with_capacity(message.len() + 48);
    buf.push(code as u8);
    encode_body(message, &mut buf);
    w.write_all(&buf).await.map_err(RpcError::from_write_io)
}

/// Reads the single request chunk of an inbound stream. Zero-size request
/// types read nothing and yield an empty payload.
pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
    kind: MessageKind,
) -> Result<Bytes, RpcError> {
    if kind.request_is_empty() {
        return Ok(Bytes::new());
    }
    let declared = read_uvarint(r).await?;
    let len = check_size_prefix(declared, kind.request_bounds())?;
    framed_decompress(r, len).await
}

/// Reads one response chunk.
///
/// Clean EOF before the response-code byte maps to `PotentiallyExpectedEof`
/// (normal termination of a list response). A non-Success code consumes the
/// bounded error payload and surfaces it as `ReceivedErrorResponse`.
pub async fn read_response_chunk<R: AsyncRead + Unpin>(
    r: &mut R,
    kind: MessageKind,
) -> Result<ResponseChunk, RpcError> {
    let code = match r.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RpcError::PotentiallyExpectedEof)
        }
        Err(e) => return Err(RpcError::BrokenConnection(e)),
    };
    let code = ResponseCode::from_u8(code).ok_or(RpcError::InvalidResponseCode(code))?;

    if code != ResponseCode::Success {
        let declared = read_uvarint(r).await?;
        let len = check_size_prefix(
            declared,
            SizeBounds {
                min: 0,
                max: MAX_ERROR_MESSAGE_LEN,
            },
        )?;
        let message = if len == 0 {
            String::new()
        } else {
            render_error_message(&framed_decompress(r, len).await?)
        };
        return Err(RpcError::ReceivedErrorResponse { code, message });
    }

    let context = if kind.response_has_context() {
        let mut ctx = [0u8; 4];
        r.read_exact(&mut ctx)
            .await
            .map_err(RpcError::from_read_io)?;
        Some(ctx)
    } else {
        None
    };

    let declared = read_uvarint(r).await?;
    let len = check_size_prefix(declared, kind.response_bounds())?;
    let payload = framed_decompress(r, len).await?;
    Ok(ResponseChunk { context, payload })
}

/// Error payloads render as ASCII when fully printable, hex otherwise.
/// Operators read these; a utf-8-or-fail decode would hide garbage bytes.
pub fn render_error_message(bytes: &[u8]) -> String {
    let printable = bytes
        .iter()
        .all(|&b| (0x20..0x7f).contains(&b) || b == b'\t');
    if printable {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        hex::encode(bytes)
    }
}
