/// Errors that can occur on the worker control sockets.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An I/O error occurred on a control socket.
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket conversion needs a tokio runtime that is not running.
    #[error("no tokio runtime available for async socket conversion")]
    NoRuntime,

    /// The socket has been shut down.
    #[error("control socket shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
