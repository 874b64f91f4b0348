use crate::protocol::constants::{CHANNEL_PREFIX_LEN, HANDSHAKE_PREFIX_LEN};
use crate::protocol::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

/// Width of the big-endian length prefix in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    /// Handshake frames
    U16,
    /// Secure channel frames
    U32,
}

impl PrefixWidth {
    pub const fn len(self) -> usize {
        match self {
            PrefixWidth::U16 => HANDSHAKE_PREFIX_LEN,
            PrefixWidth::U32 => CHANNEL_PREFIX_LEN,
        }
    }

    /// Largest length the prefix can express
    pub const fn max_len(self) -> usize {
        match self {
            PrefixWidth::U16 => u16::MAX as usize,
            PrefixWidth::U32 => u32::MAX as usize,
        }
    }

    fn encode(self, len: usize, out: &mut Vec<u8>) {
        match self {
            PrefixWidth::U16 => out.extend_from_slice(&(len as u16).to_be_bytes()),
            PrefixWidth::U32 => out.extend_from_slice(&(len as u32).to_be_bytes()),
        }
    }

    fn decode(self, buf: &[u8]) -> usize {
        match self {
            PrefixWidth::U16 => u16::from_be_bytes([buf[0], buf[1]]) as usize,
            PrefixWidth::U32 => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
        }
    }
}

/// Write the length prefix and the payload as one buffer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    width: PrefixWidth,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() > width.max_len() {
        error!(
            "Frame payload of {} bytes does not fit a {}-byte prefix",
            payload.len(),
            width.len()
        );
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: width.max_len(),
        });
    }

    let mut buf = Vec::with_capacity(width.len() + payload.len());
    width.encode(payload.len(), &mut buf);
    buf.extend_from_slice(payload);

    stream.write_all(&buf).await?;
    stream.flush().await?;

    trace!("Wrote frame: prefix={} payload={} bytes", width.len(), payload.len());
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
/// boundary. A close part way through the prefix or the payload is reported
/// as [`ProtocolError::Truncated`] with the number of bytes actually received.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    width: PrefixWidth,
    max_len: usize,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut prefix = [0u8; 4];
    let prefix = &mut prefix[..width.len()];
    let got = read_full(stream, prefix).await?;
    if got == 0 {
        trace!("Stream closed on frame boundary");
        return Ok(None);
    }
    if got < width.len() {
        return Err(ProtocolError::Truncated {
            expected: width.len(),
            received: got,
        });
    }

    let len = width.decode(prefix);
    if len > max_len {
        error!("Declared frame length {} exceeds maximum {}", len, max_len);
        return Err(ProtocolError::FrameTooLarge { size: len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    let got = read_full(stream, &mut payload).await?;
    if got < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            received: got,
        });
    }

    trace!("Read frame: prefix={} payload={} bytes", width.len(), len);
    Ok(Some(payload))
}

/// Fill `buf` from the stream, looping over partial reads. Stops early only
/// at end of stream and returns the number of bytes obtained.
async fn read_full<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_both_widths() {
        for width in [PrefixWidth::U16, PrefixWidth::U32] {
            let mut buf = Vec::new();
            write_frame(&mut buf, width, b"hello").await.unwrap();
            assert_eq!(buf.len(), width.len() + 5);

            let mut reader = buf.as_slice();
            let frame = read_frame(&mut reader, width, 1024).await.unwrap();
            assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
            assert!(read_frame(&mut reader, width, 1024).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_prefix_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, PrefixWidth::U32, &[0u8; 258]).await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        // A one-byte pipe forces every read to return a single byte
        let (mut tx, mut rx) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            write_frame(&mut tx, PrefixWidth::U32, b"split across many reads").await.unwrap();
        });

        let frame = read_frame(&mut rx, PrefixWidth::U32, 1024).await.unwrap();
        writer.await.unwrap();
        assert_eq!(frame.unwrap(), b"split across many reads");
    }

    #[tokio::test]
    async fn test_short_payload_is_truncated() {
        let data = [0u8, 0, 0, 10, 1, 2, 3];
        let mut reader = &data[..];
        match read_frame(&mut reader, PrefixWidth::U32, 1024).await {
            Err(ProtocolError::Truncated { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_prefix_is_truncated() {
        let data = [0u8, 0];
        let mut reader = &data[..];
        let err = read_frame(&mut reader, PrefixWidth::U32, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { expected: 4, received: 2 }));
    }

    #[tokio::test]
    async fn test_oversized_declared_length_rejected() {
        let data = [0xFFu8, 0xFF, 0xFF, 0xFF];
        let mut reader = &data[..];
        let err = read_frame(&mut reader, PrefixWidth::U32, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size, max: 1024 } if size == u32::MAX as usize
        ));
    }

    #[tokio::test]
    async fn test_handshake_payload_must_fit_prefix() {
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, PrefixWidth::U16, &vec![0u8; 70_000]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, PrefixWidth::U32, &[]).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(read_frame(&mut reader, PrefixWidth::U32, 16).await.unwrap(), Some(Vec::new()));
    }
}
