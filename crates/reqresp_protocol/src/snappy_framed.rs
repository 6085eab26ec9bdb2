use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::RpcError;

const STREAM_HEADER: [u8; 10] = [0xff, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y'];

const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;

/// Max uncompressed bytes per sub-frame, fixed by the snappy framing format.
const MAX_FRAME_UNCOMPRESSED: usize = 65536;

/// Checksums are CRC-32C, masked so that checksumming data containing
/// embedded CRCs stays well-behaved.
fn masked_crc(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
        .rotate_right(15)
        .wrapping_add(0xa282ead8)
}

fn max_frame_data_len() -> usize {
    4 + snap::raw::max_compress_len(MAX_FRAME_UNCOMPRESSED)
}

/// Compresses a payload into a self-contained framed-snappy stream
/// (stream identifier + one frame per 64 KiB of input).
pub fn framed_compress(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(STREAM_HEADER.len() + payload.len() / 2 + 64);
    out.extend_from_slice(&STREAM_HEADER);

    let mut encoder = snap::raw::Encoder::new();
    for chunk in payload.chunks(MAX_FRAME_UNCOMPRESSED) {
        let crc = masked_crc(chunk);
        let compressed = encoder
            .compress_vec(chunk)
            .expect("raw snappy compression of a bounded chunk cannot fail");
        let (id, data) = if compressed.len() < chunk.len() {
            (CHUNK_COMPRESSED, compressed.as_slice())
        } else {
            (CHUNK_UNCOMPRESSED, chunk)
        };
        let frame_len = (4 + data.len()) as u32;
        out.extend_from_slice(&[
            id,
            frame_len as u8,
            (frame_len >> 8) as u8,
            (frame_len >> 16) as u8,
        ]);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(data);
    }
    out.freeze()
}

/// Streams a framed-snappy payload into a buffer of exactly
/// `uncompressed_len` bytes, sized up front from the chunk's LEB128 prefix.
///
/// Skippable frames (id >= 0x80) are discarded; reserved unskippable ids
/// fail. Ending before the buffer is full is `UnexpectedEof`; producing more
/// than declared fails without writing past the buffer.
pub async fn framed_decompress<R: AsyncRead + Unpin>(
    r: &mut R,
    uncompressed_len: usize,
) -> Result<Bytes, RpcError> {
    let mut header = [0u8; STREAM_HEADER.len()];
    r.read_exact(&mut header)
        .await
        .map_err(RpcError::from_read_io)?;
    if header != STREAM_HEADER {
        return Err(RpcError::InvalidSnappyBytes("bad stream identifier"));
    }

    let mut out = BytesMut::zeroed(uncompressed_len);
    let mut filled = 0usize;
    let mut decoder = snap::raw::Decoder::new();
    let mut frame = Vec::new();

    while filled < uncompressed_len {
        let mut fh = [0u8; 4];
        r.read_exact(&mut fh).await.map_err(RpcError::from_read_io)?;
        let id = fh[0];
        let len = fh[1] as usize | (fh[2] as usize) << 8 | (fh[3] as usize) << 16;

        if id >= 0x80 {
            // Skippable frame: read and discard.
            frame.resize(len, 0);
            r.read_exact(&mut frame)
                .await
                .map_err(RpcError::from_read_io)?;
            continue;
        }
        match id {
            CHUNK_COMPRESSED => {
                if len < 6 {
                    return Err(RpcError::InvalidSnappyBytes("short compressed frame"));
                }
            }
            CHUNK_UNCOMPRESSED => {
                if len < 5 {
                    return Err(RpcError::InvalidSnappyBytes("short uncompressed frame"));
                }
            }
            _ => return Err(RpcError::InvalidSnappyBytes("reserved unskippable frame")),
        }
        if len > max_frame_data_len() {
            return Err(RpcError::InvalidSnappyBytes("oversized frame"));
        }

        frame.resize(len, 0);
        r.read_exact(&mut frame)
            .await
            .map_err(RpcError::from_read_io)?;
        let crc = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let data = &frame[4..];

        let produced = if id == CHUNK_COMPRESSED {
            let dlen = snap::raw::decompress_len(data)
                .map_err(|_| RpcError::InvalidSnappyBytes("bad compressed length header"))?;
            if dlen > MAX_FRAME_UNCOMPRESSED {
                return Err(RpcError::InvalidSnappyBytes("frame exceeds 64KiB"));
            }
            if dlen > uncompressed_len - filled {
                return Err(RpcError::InvalidSnappyBytes("more data than declared"));
            }
            decoder
                .decompress(data, &mut out[filled..filled + dlen])
                .map_err(|_| RpcError::InvalidSnappyBytes("corrupt compressed frame"))?
        } else {
            let dlen = data.len();
            if dlen > uncompressed_len - filled {
                return Err(RpcError::InvalidSnappyBytes("more data than declared"));
            }
            out[filled..filled + dlen].copy_from_slice(data);
            dlen
        };

        if masked_crc(&out[filled..filled + produced]) != crc {
            return Err(RpcError::InvalidSnappyBytes("crc mismatch"));
        }
        filled += produced;
    }

    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(payload: &[u8]) -> Bytes {
        let compressed = framed_compress(payload);
        framed_decompress(&mut compressed.as_ref(), payload.len())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_small() {
        let payload = b"hello hello hello hello hello hello";
        assert_eq!(roundtrip(payload).await.as_ref(), payload);
    }

    #[tokio::test]
    async fn test_roundtrip_multi_frame() {
        // Spans three sub-frames.
        let payload: Vec<u8> = (0..(MAX_FRAME_UNCOMPRESSED * 2 + 1234))
            .map(|i| (i % 251) as u8)
            .collect();
        assert_eq!(roundtrip(&payload).await.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_incompressible_uses_uncompressed_frame() {
        // High-entropy-ish input that raw snappy cannot shrink.
        let payload: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let compressed = framed_compress(&payload);
        assert_eq!(compressed[STREAM_HEADER.len()], CHUNK_UNCOMPRESSED);
        assert_eq!(roundtrip(&payload).await.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_bad_stream_header() {
        let mut data = framed_compress(b"payload").to_vec();
        data[4] = b'X';
        assert!(matches!(
            framed_decompress(&mut data.as_slice(), 7).await,
            Err(RpcError::InvalidSnappyBytes("bad stream identifier"))
        ));
    }

    #[tokio::test]
    async fn test_crc_mismatch() {
        let mut data = framed_compress(b"payload payload payload").to_vec();
        // Flip a checksum bit in the first frame.
        data[STREAM_HEADER.len() + 4] ^= 0x01;
        assert!(matches!(
            framed_decompress(&mut data.as_slice(), 23).await,
            Err(RpcError::InvalidSnappyBytes("crc mismatch"))
        ));
    }

    #[tokio::test]
    async fn test_reserved_unskippable_fails() {
        let mut data = STREAM_HEADER.to_vec();
        data.extend_from_slice(&[0x02, 5, 0, 0]);
        data.extend_from_slice(&[0u8; 5]);
        assert!(matches!(
            framed_decompress(&mut data.as_slice(), 1).await,
            Err(RpcError::InvalidSnappyBytes("reserved unskippable frame"))
        ));
    }

    #[tokio::test]
    async fn test_skippable_frame_is_ignored() {
        let payload = b"data after padding";
        let compressed = framed_compress(payload);
        let mut data = STREAM_HEADER.to_vec();
        data.extend_from_slice(&[0xfe, 3, 0, 0]);
        data.extend_from_slice(b"pad");
        data.extend_from_slice(&compressed[STREAM_HEADER.len()..]);
        let out = framed_decompress(&mut data.as_slice(), payload.len())
            .await
            .unwrap();
        assert_eq!(out.as_ref(), payload);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_eof() {
        let compressed = framed_compress(b"some payload bytes");
        let truncated = &compressed[..compressed.len() - 3];
        assert!(matches!(
            framed_decompress(&mut &truncated[..], 18).await,
            Err(RpcError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_more_data_than_declared_fails() {
        let compressed = framed_compress(b"twelve bytes");
        assert!(matches!(
            framed_decompress(&mut compressed.as_ref(), 5).await,
            Err(RpcError::InvalidSnappyBytes("more data than declared"))
        ));
    }
}
