use tokio::io::{AsyncRead, AsyncReadExt};

use crate::RpcError;

/// A u64 LEB128 varint is at most 10 bytes.
pub const MAX_UVARINT_LEN: usize = 10;

pub fn write_uvarint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint one byte at a time.
pub async fn read_uvarint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, RpcError> {
    let mut value: u64 = 0;
    for i in 0..MAX_UVARINT_LEN {
        let byte = r.read_u8().await.map_err(RpcError::from_read_io)?;
        let bits = (byte & 0x7f) as u64;
        // The tenth byte may only carry the u64's final bit.
        if i == MAX_UVARINT_LEN - 1 && bits > 1 {
            return Err(RpcError::InvalidSizePrefix {
                declared: u64::MAX,
                min: 0,
                max: 0,
            });
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(RpcError::InvalidSizePrefix {
        declared: u64::MAX,
        min: 0,
        max: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(v: u64) -> u64 {
        let mut buf = Vec::new();
        write_uvarint(v, &mut buf);
        read_uvarint(&mut buf.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        for v in [0, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            assert_eq!(roundtrip(v).await, v);
        }
    }

    #[test]
    fn test_encoding_lengths() {
        let mut buf = Vec::new();
        write_uvarint(0, &mut buf);
        assert_eq!(buf, vec![0]);
        buf.clear();
        write_uvarint(127, &mut buf);
        assert_eq!(buf, vec![0x7f]);
        buf.clear();
        write_uvarint(128, &mut buf);
        assert_eq!(buf, vec![0x80, 0x01]);
        buf.clear();
        write_uvarint(u64::MAX, &mut buf);
        assert_eq!(buf.len(), MAX_UVARINT_LEN);
    }

    #[tokio::test]
    async fn test_overlong_rejected() {
        // 11 continuation bytes never terminate within the allowed length.
        let bytes = [0xffu8; 11];
        assert!(matches!(
            read_uvarint(&mut &bytes[..]).await,
            Err(RpcError::InvalidSizePrefix { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_is_eof() {
        let bytes = [0x80u8];
        assert!(matches!(
            read_uvarint(&mut &bytes[..]).await,
            Err(RpcError::UnexpectedEof)
        ));
    }
}
