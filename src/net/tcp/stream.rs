use std::io;
use std::net::SocketAddr;

use socket2::{Protocol, SockRef, Socket, Type};

use crate::net::channel::Channel;
use crate::net::{convert_address, new_socket};
use crate::{Error, Interest, Selector};

/// A non-blocking TCP stream driven by a [`Selector`].
///
/// Reads and writes are retry loops: the syscall is attempted, and on
/// `WouldBlock` the stream arms its registration and suspends until the
/// kernel reports readiness. One in-flight read and one in-flight write at a
/// time; full-duplex use from distinct tasks is not supported.
pub struct TcpStream {
    channel: Channel,
}

impl TcpStream {
    /// Opens a connection to `addr`.
    ///
    /// Issues a non-blocking `connect(2)`, arms for writability while the
    /// handshake is in flight and materializes the outcome from `SO_ERROR`.
    pub async fn connect(selector: &Selector, addr: SocketAddr) -> Result<TcpStream, Error> {
        let socket = new_socket(addr, Type::STREAM, Protocol::TCP).map_err(Error::Os)?;

        let in_flight = match socket.connect(&addr.into()) {
            Ok(()) => false,
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => true,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => true,
            Err(err) => return Err(Error::Os(err)),
        };

        let mut channel = Channel::register(
            selector,
            socket.into(),
            Interest::READABLE | Interest::WRITABLE,
        )
        .await?;

        if in_flight {
            loop {
                channel.await_ready(Interest::WRITABLE).await?;
                match channel.socket_error()? {
                    None => break,
                    // A spurious wakeup before the handshake settled.
                    Some(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Some(err) => {
                        let _ = channel.close().await;
                        return Err(Error::Os(err));
                    }
                }
            }
        }

        Ok(TcpStream { channel })
    }

    /// Wraps an already-connected socket, registering it with `selector`.
    /// Used by [`TcpListener::accept`].
    ///
    /// [`TcpListener::accept`]: crate::net::TcpListener::accept
    pub(crate) async fn from_socket(selector: &Selector, socket: Socket) -> Result<TcpStream, Error> {
        let channel = Channel::register(
            selector,
            socket.into(),
            Interest::READABLE | Interest::WRITABLE,
        )
        .await?;
        Ok(TcpStream { channel })
    }

    /// Reads into `buf`, suspending until data or EOF is available.
    ///
    /// Returns 0 at EOF and for an empty `buf`. After [`shutdown_read`] all
    /// reads return 0 without a syscall.
    ///
    /// [`shutdown_read`]: TcpStream::shutdown_read
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.channel.read(buf).await
    }

    /// Writes from `buf`, returning the possibly-partial count.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.channel.write(buf).await
    }

    /// Writes the whole of `buf`, iterating over partial writes.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.channel.write_all(buf).await
    }

    /// Shuts down the read half; idempotent.
    pub fn shutdown_read(&mut self) -> Result<(), Error> {
        self.channel.shutdown_read()
    }

    /// Shuts down the write half; idempotent. Later writes fail with
    /// [`Error::WriteClosed`], the peer observes EOF.
    pub fn shutdown_write(&mut self) -> Result<(), Error> {
        self.channel.shutdown_write()
    }

    /// Deregisters and closes the stream; idempotent.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.channel.close().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let fd = self.channel.fd().ok_or(Error::Internal("stream closed"))?;
        convert_address(SockRef::from(fd).local_addr().map_err(Error::Os)?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        let fd = self.channel.fd().ok_or(Error::Internal("stream closed"))?;
        convert_address(SockRef::from(fd).peer_addr().map_err(Error::Os)?)
    }

    /// Sets `TCP_NODELAY`, disabling the Nagle algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<(), Error> {
        let fd = self.channel.fd().ok_or(Error::Internal("stream closed"))?;
        SockRef::from(fd).set_nodelay(nodelay).map_err(Error::Os)
    }

    pub fn nodelay(&self) -> Result<bool, Error> {
        let fd = self.channel.fd().ok_or(Error::Internal("stream closed"))?;
        SockRef::from(fd).nodelay().map_err(Error::Os)
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream").finish_non_exhaustive()
    }
}
