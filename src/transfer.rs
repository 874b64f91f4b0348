//! Chunked streaming of a file body whose total length was announced in
//! the packet header. There is no end-of-body marker: the receiver stops
//! once it has consumed the declared number of bytes.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::protocol::{ProtocolError, Transport};

/// Progress callback: `(bytes_done, bytes_total)`
pub type Progress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Stream `file_size` bytes of `path` as messages of at most `chunk_size`
/// bytes. Fails with `SizeMismatch` if the file runs out early.
pub async fn send_body<T: Transport + ?Sized>(
    path: &Path,
    transport: &mut T,
    file_size: u64,
    chunk_size: usize,
    progress: Option<Progress<'_>>,
) -> Result<u64, ProtocolError> {
    let file = File::open(path).await?;
    let mut reader = file.take(file_size);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;

    loop {
        let n = fill_chunk(&mut reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        transport.send(&buf[..n]).await?;
        sent += n as u64;
        if let Some(report) = progress {
            report(sent, file_size);
        }
    }

    if sent != file_size {
        return Err(ProtocolError::SizeMismatch {
            declared: file_size,
            actual: sent,
        });
    }
    debug!("Sent body of {} bytes from {:?}", sent, path);
    Ok(sent)
}

/// Write up to `total_size` received bytes to `dest_path`.
///
/// Stops early without error if the channel closes; the caller learns how
/// many bytes actually arrived from the return value.
pub async fn receive_body<T: Transport + ?Sized>(
    transport: &mut T,
    dest_path: &Path,
    total_size: u64,
    progress: Option<Progress<'_>>,
) -> Result<u64, ProtocolError> {
    let mut file = File::create(dest_path).await?;
    let mut remaining = total_size;

    while remaining > 0 {
        let chunk = match transport.recv().await? {
            Some(chunk) if !chunk.is_empty() => chunk,
            _ => break,
        };
        if chunk.len() as u64 > remaining {
            return Err(ProtocolError::SizeMismatch {
                declared: total_size,
                actual: total_size - remaining + chunk.len() as u64,
            });
        }
        file.write_all(&chunk).await?;
        remaining -= chunk.len() as u64;
        if let Some(report) = progress {
            report(total_size - remaining, total_size);
        }
    }
    file.flush().await?;

    let received = total_size - remaining;
    if remaining > 0 {
        warn!("Body ended early: {} of {} bytes written to {:?}", received, total_size, dest_path);
    } else {
        debug!("Received body of {} bytes into {:?}", received, dest_path);
    }
    Ok(received)
}

/// Consume and drop a body, keeping the message stream aligned.
pub async fn discard_body<T: Transport + ?Sized>(
    transport: &mut T,
    total_size: u64,
) -> Result<u64, ProtocolError> {
    let mut remaining = total_size;
    while remaining > 0 {
        match transport.recv().await? {
            Some(chunk) if !chunk.is_empty() => {
                remaining = remaining.saturating_sub(chunk.len() as u64);
            }
            _ => break,
        }
    }
    Ok(total_size - remaining)
}

async fn fill_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
