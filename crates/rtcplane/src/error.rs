use rtcplane_channel::RequestError;

/// Errors surfaced by router, transport and resource operations.
///
/// `Clone` so a shared in-flight pipe pair can hand the same failure to
/// every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The resource or the channel is closed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed caller input, rejected before contacting the worker.
    #[error("invalid input: {0}")]
    TypeValidation(String),

    /// Parameters are incompatible with the router capabilities.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{kind} with id \"{id}\" not found")]
    NotFound { kind: &'static str, id: String },

    /// Every SCTP stream id of the transport is in use.
    #[error("no sctp stream id available")]
    NoSctpStreamId,

    /// The worker answered with a body this client cannot read.
    #[error("invalid response from worker: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Request(#[from] RequestError),
}

impl Error {
    pub(crate) fn closed(what: &str) -> Self {
        Self::InvalidState(format!("{what} closed"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
