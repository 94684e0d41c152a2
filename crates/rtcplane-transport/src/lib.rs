//! Control socket boundary between rtcplane and a media worker process.
//!
//! The worker supervisor (out of scope here) spawns the worker and hands
//! over two already-connected local stream sockets:
//! - the *producer* socket, written by us (commands to the worker)
//! - the *consumer* socket, read by us (responses, notifications, logs)
//!
//! This is the lowest layer of rtcplane. Everything else builds on top of
//! the [`WorkerSockets`] pair provided here.

pub mod error;

#[cfg(unix)]
pub mod socket;

pub use error::{Result, TransportError};

#[cfg(unix)]
pub use socket::{ControlSocket, WorkerSockets};
