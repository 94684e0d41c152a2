/// Errors that can occur while setting up or running the channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Socket-level error.
    #[error("transport error: {0}")]
    Transport(#[from] rtcplane_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] rtcplane_frame::FrameError),

    /// Message could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The channel is closed.
    #[error("channel closed")]
    Closed,
}

/// Message serialization failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Outcome of a failed request.
///
/// `Clone` so a single failure can be observed by several awaiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The channel was closed before or while the request was pending.
    #[error("channel closed")]
    ChannelClosed,

    /// The encoded request does not fit in one frame.
    #[error("request too big ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The request could not be serialized.
    #[error("failed to encode request: {0}")]
    Codec(String),

    /// The request frame could not be written to the worker.
    #[error("failed to send request: {0}")]
    Io(String),

    /// The worker rejected the request as malformed.
    #[error("worker type error: {0}")]
    TypeError(String),

    /// The worker rejected the request.
    #[error("request rejected by worker: {reason}")]
    Response { reason: String },

    /// The worker answered with something that is neither an acceptance
    /// nor a rejection, or with an undecodable body.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
