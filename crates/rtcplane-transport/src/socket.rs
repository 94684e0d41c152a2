use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use tracing::debug;

use crate::error::{Result, TransportError};

/// One connected local stream socket of the worker control pair.
///
/// Implements `Read + Write` so it can be driven synchronously; with the
/// `async` feature it converts into a `tokio::net::UnixStream`.
pub struct ControlSocket {
    inner: UnixStream,
}

impl ControlSocket {
    /// Wrap an already-connected Unix stream.
    pub fn from_std(stream: UnixStream) -> Self {
        Self { inner: stream }
    }

    /// Create two connected sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((Self::from_std(left), Self::from_std(right)))
    }

    /// Try to clone this socket (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_std(self.inner.try_clone()?))
    }

    /// Shut down both directions of the socket.
    pub fn shutdown(&self) -> Result<()> {
        match self.inner.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => {
                Err(TransportError::Shutdown)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Consume the wrapper and return the std stream.
    pub fn into_std(self) -> UnixStream {
        self.inner
    }

    /// Convert into a tokio stream registered with the current runtime.
    #[cfg(feature = "async")]
    pub fn into_tokio(self) -> Result<tokio::net::UnixStream> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TransportError::NoRuntime);
        }
        self.inner.set_nonblocking(true)?;
        Ok(tokio::net::UnixStream::from_std(self.inner)?)
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = self.inner.as_raw_fd();

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl Read for ControlSocket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for ControlSocket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for ControlSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSocket").field("type", &"unix").finish()
    }
}

/// The two sockets connecting us to one worker process.
#[derive(Debug)]
pub struct WorkerSockets {
    /// Written by us: requests and notifications for the worker.
    pub producer: ControlSocket,
    /// Read by us: responses, notifications and log lines from the worker.
    pub consumer: ControlSocket,
}

impl WorkerSockets {
    /// Assemble the pair from sockets connected by the process supervisor.
    pub fn new(producer: ControlSocket, consumer: ControlSocket) -> Self {
        Self { producer, consumer }
    }

    /// Build two connected socket pairs.
    ///
    /// Returns `(client, worker)`. The worker side has the roles swapped:
    /// what the client writes on `producer` the worker reads on its
    /// `consumer`, and vice versa.
    pub fn pair() -> Result<(Self, Self)> {
        let (client_producer, worker_consumer) = ControlSocket::pair()?;
        let (worker_producer, client_consumer) = ControlSocket::pair()?;
        debug!("created in-process worker socket pair");

        Ok((
            Self::new(client_producer, client_consumer),
            Self::new(worker_producer, worker_consumer),
        ))
    }

    /// Pid of the process on the other end of the consumer socket.
    pub fn worker_pid(&self) -> Option<u32> {
        self.consumer.peer_credentials().map(|(_, _, pid)| pid)
    }

    /// Convert both sockets into tokio streams: `(writer, reader)`.
    #[cfg(feature = "async")]
    pub fn into_tokio(self) -> Result<(tokio::net::UnixStream, tokio::net::UnixStream)> {
        Ok((self.producer.into_tokio()?, self.consumer.into_tokio()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_routes_client_writes_to_worker_reads() {
        let (mut client, mut worker) = WorkerSockets::pair().unwrap();

        client.producer.write_all(b"command").unwrap();
        let mut buf = [0u8; 7];
        worker.consumer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"command");

        worker.producer.write_all(b"event").unwrap();
        let mut buf = [0u8; 5];
        client.consumer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"event");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn worker_pid_is_reported_for_in_process_pair() {
        let (client, _worker) = WorkerSockets::pair().unwrap();
        assert_eq!(client.worker_pid(), Some(std::process::id()));
    }

    #[test]
    fn shutdown_signals_eof_to_peer() {
        let (left, mut right) = ControlSocket::pair().unwrap();
        left.shutdown().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(right.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn try_clone_shares_the_connection() {
        let (left, mut right) = ControlSocket::pair().unwrap();
        let mut clone = left.try_clone().unwrap();

        clone.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    #[cfg(feature = "async")]
    fn into_tokio_requires_runtime() {
        let (left, _right) = ControlSocket::pair().unwrap();
        assert!(matches!(left.into_tokio(), Err(TransportError::NoRuntime)));
    }

    #[tokio::test]
    #[cfg(feature = "async")]
    async fn into_tokio_inside_runtime() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, worker) = WorkerSockets::pair().unwrap();
        let (mut writer, _reader) = client.into_tokio().unwrap();
        let (_worker_writer, mut worker_reader) = worker.into_tokio().unwrap();

        writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        worker_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
