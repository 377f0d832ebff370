//! Packet framing.
//!
//! A frame is a 4-byte big-endian length prefix followed by the
//! postcard-encoded [`Packet`]. Frames larger than [`MAX_FRAME_SIZE`] are
//! rejected on both ends.

use bytes::{BufMut, Bytes, BytesMut};
use ringmq_types::Packet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

/// Maximum frame payload: 64 MB.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode a packet as one frame.
pub fn encode_frame(packet: &Packet) -> Result<Bytes, NetError> {
    let payload =
        postcard::to_allocvec(packet).map_err(|e| NetError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetError::Frame(format!(
            "packet too large: {} bytes (max {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode exactly one frame.
///
/// Trailing bytes after the announced length are an error.
pub fn decode_frame(frame: &[u8]) -> Result<Packet, NetError> {
    if frame.len() < LEN_PREFIX {
        return Err(NetError::Frame(format!(
            "truncated length prefix: {} bytes",
            frame.len()
        )));
    }
    let mut len_buf = [0u8; LEN_PREFIX];
    len_buf.copy_from_slice(&frame[..LEN_PREFIX]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(NetError::Frame(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let payload = &frame[LEN_PREFIX..];
    if payload.len() != len {
        return Err(NetError::Frame(format!(
            "length mismatch: prefix says {len}, got {}",
            payload.len()
        )));
    }

    postcard::from_bytes(payload).map_err(|e| NetError::Serialization(e.to_string()))
}

/// Write one frame to a stream.
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Packet, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(NetError::Frame(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))
}
