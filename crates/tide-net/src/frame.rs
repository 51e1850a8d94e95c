//! Length-prefixed framing for QUIC streams.
//!
//! A frame is a 4-byte big-endian length followed by that many payload
//! bytes. Frames larger than the caller's limit are refused before any
//! payload is read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

/// Write one frame.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| NetError::MessageTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one frame of at most `max` bytes.
pub(crate) async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(NetError::MessageTooLarge { size: len, max });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
