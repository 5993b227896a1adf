//! Length-prefixed framing over any async byte stream.
//!
//! Each frame is a 4-byte little-endian length followed by that many envelope
//! bytes. The length is checked against the frame cap before any buffer is
//! allocated; a zero length is rejected. Header and body go out in a single
//! write so frames never interleave.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_SIZE;
use crate::ipc::envelope::Envelope;
use crate::ipc::ProtocolError;

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_envelope_with_limit(writer, envelope, MAX_FRAME_SIZE).await
}

pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    read_envelope_with_limit(reader, MAX_FRAME_SIZE).await
}

pub async fn write_envelope_with_limit<W>(
    writer: &mut W,
    envelope: &Envelope,
    max_frame: usize,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = envelope.encode()?;
    if body.len() > max_frame {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: max_frame,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_envelope_with_limit<R>(
    reader: &mut R,
    max_frame: usize,
) -> Result<Envelope, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > max_frame {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_frame,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Envelope::decode(&buf)
}
