//! Length-prefixed message framing for the worker control channel.
//!
//! Every unit sent or received is framed as:
//! - A 4-byte payload length in host byte order
//! - The payload itself (at most 4 MiB)
//!
//! Readers accumulate arbitrary socket reads and only ever hand out
//! complete payloads. No partial frames, no buffer management in user code.

pub mod buffer;
pub mod codec;
pub mod error;

#[cfg(feature = "async")]
pub mod reader;
#[cfg(feature = "async")]
pub mod writer;

pub use buffer::RecvBuffer;
pub use codec::{
    decode_frame, encode_frame, FrameConfig, HEADER_SIZE, MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
};
#[cfg(feature = "async")]
pub use codec::FrameCodec;
pub use error::{FrameError, Result};
#[cfg(feature = "async")]
pub use reader::{FrameBatch, FrameReader};
#[cfg(feature = "async")]
pub use writer::FrameWriter;
