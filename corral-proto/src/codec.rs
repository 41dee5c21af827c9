//! Length-prefixed JSON frame codec for byte-stream transports.
//!
//! Each frame is `[u32 big-endian length][JSON body]`. The body is the raw
//! envelope value; envelope validation happens one layer up so that a
//! well-framed but foreign message can be dropped without tearing down the
//! stream.

use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reads one frame body without decoding it.
///
/// Returns `UnexpectedEof` when the stream ends before a full frame. Any other
/// error leaves the stream position undefined.
pub async fn read_frame<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes"),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads one length-prefixed JSON value.
///
/// Returns `UnexpectedEof` when the stream ends before a full frame.
pub async fn read_message<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<Value> {
    let buf = read_frame(io).await?;
    serde_json::from_slice(&buf).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON decode error: {e}"),
        )
    })
}

/// Writes one length-prefixed JSON value and flushes.
pub async fn write_message<T: AsyncWrite + Unpin>(io: &mut T, message: &Value) -> io::Result<()> {
    let data = serde_json::to_vec(message).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON encode error: {e}"),
        )
    })?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes", data.len()),
        ));
    }

    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&data).await?;
    io.flush().await
}
