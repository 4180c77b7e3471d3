//! Length-prefixed framing of envelopes over a byte stream.
//!
//! A frame is a 4-byte big-endian body length followed by exactly that many
//! bytes of CBOR-encoded [`Envelope`]. The length is checked against the
//! configured maximum as soon as the prefix is available, before any room
//! is reserved for the body.

use crate::transport::Envelope;
use crate::utils::{ProtocolError, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Read buffer growth per socket read
const READ_CHUNK: usize = 8 * 1024;

/// Encode an envelope as a complete frame
///
/// # Errors
///
/// Returns `ProtocolError::FrameTooLarge` if the body exceeds `max_frame_size`
pub fn encode_frame(envelope: &Envelope, max_frame_size: usize) -> Result<Vec<u8>> {
    let body = envelope.to_bytes()?;
    if body.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        }
        .into());
    }

    let length = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: body.len(),
        max: max_frame_size,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Streaming frame decoder
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects bodies larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK),
            max_frame_size,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete envelope, if one is fully buffered
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooLarge` as soon as an oversized prefix is seen
    /// - `ProtocolError::MalformedFrame` if the body is not a valid envelope
    pub fn decode(&mut self) -> Result<Option<Envelope>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            }
            .into());
        }

        let needed = LENGTH_PREFIX_SIZE + length;
        if self.buffer.len() < needed {
            self.buffer.reserve(needed - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        let body = self.buffer.split_to(length);
        Envelope::from_bytes(&body).map(Some)
    }
}

/// Read the next envelope from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// Cancel-safe: bytes already read stay in `decoder`.
pub async fn read_envelope<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(envelope) = decoder.decode()? {
            return Ok(Some(envelope));
        }

        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            if decoder.buffered() == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::MalformedFrame {
                reason: format!("stream closed with {} bytes of a partial frame", decoder.buffered()),
            }
            .into());
        }
        decoder.extend(&chunk[..read]);
    }
}

/// Write one envelope as a single frame and flush it
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope, max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
