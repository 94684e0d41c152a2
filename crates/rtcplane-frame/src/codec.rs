use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: payload length (4 bytes, host byte order).
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size: 4 MiB.
pub const MAX_PAYLOAD_LEN: usize = 4_194_304;

/// Maximum frame size including the length prefix.
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_LEN + HEADER_SIZE;

/// Default size of a single socket read.
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬──────────────────┐
/// │ Length (4B, host │ Payload          │
/// │ byte order)      │ (Length bytes)   │
/// └──────────────────┴──────────────────┘
/// ```
///
/// Fails before touching `dst` when the payload is larger than `max_payload`.
pub fn encode_frame(payload: &[u8], max_payload: usize, dst: &mut BytesMut) -> Result<()> {
    let max = max_payload.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32_ne(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer and returns the payload.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; HEADER_SIZE];
    prefix.copy_from_slice(&src[..HEADER_SIZE]);
    let payload_len = u32::from_ne_bytes(prefix) as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

/// Configuration for framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes, both directions. Default: 4 MiB.
    pub max_payload_size: usize,
    /// Bytes requested from the socket per read. Default: 64 KiB.
    pub read_chunk_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_LEN,
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

/// `tokio_util` codec speaking the same wire format, for peers that drive
/// the channel through a `Framed` stream.
#[cfg(feature = "async")]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
}

#[cfg(feature = "async")]
impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

#[cfg(feature = "async")]
impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LEN)
    }
}

#[cfg(feature = "async")]
impl tokio_util::codec::Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        decode_frame(src, self.max_payload_size)
    }
}

#[cfg(feature = "async")]
impl tokio_util::codec::Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&item, self.max_payload_size, dst)
    }
}
