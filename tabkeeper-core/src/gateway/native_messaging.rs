//! Native messaging framing: a 4-byte little-endian length followed by a
//! UTF-8 JSON body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from the browser.
pub const MAX_INBOUND_FRAME: usize = 4 * 1024 * 1024;
/// Browsers refuse host messages above 1 MiB.
pub const MAX_OUTBOUND_FRAME: usize = 1024 * 1024;

/// One length-prefixed frame as read off the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Body(Vec<u8>),
    /// A frame above [`MAX_INBOUND_FRAME`]. Its body was discarded so the
    /// stream stays aligned on the next frame.
    Oversized(usize),
}

/// Read one frame without decoding it. Returns `Ok(None)` on a clean end
/// of stream.
pub async fn read_raw_frame<R>(reader: &mut R) -> io::Result<Option<InboundFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let length = u32::from_le_bytes(length_bytes) as usize;
    if length > MAX_INBOUND_FRAME {
        let mut body = (&mut *reader).take(length as u64);
        let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        if skipped < length as u64 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        return Ok(Some(InboundFrame::Oversized(length)));
    }

    let mut buffer = vec![0u8; length];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(InboundFrame::Body(buffer)))
}

/// Read and decode one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_raw_frame(reader).await? {
        None => Ok(None),
        Some(InboundFrame::Oversized(length)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", length),
        )),
        Some(InboundFrame::Body(body)) => serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}

/// Encode `message` as a frame body, refusing bodies the browser would drop.
pub fn encode_frame<T>(message: &T) -> io::Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if json.len() > MAX_OUTBOUND_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("response of {} bytes exceeds limit", json.len()),
        ));
    }
    Ok(json)
}

/// Write an encoded body with its length prefix and flush.
pub async fn write_raw_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = encode_frame(message)?;
    write_raw_frame(writer, &body).await
}
