use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use socket2::{Protocol, SockRef, Socket, Type};

use crate::net::channel::Channel;
use crate::net::tcp::TcpStream;
use crate::net::{convert_address, interrupted, new_socket, would_block};
use crate::sys::unix::syscall;
use crate::{Error, Interest, Selector};

/// A non-blocking TCP listener driven by a [`Selector`].
pub struct TcpListener {
    channel: Channel,
}

impl TcpListener {
    /// Binds a listener to `addr`.
    ///
    /// Sets `SO_REUSEADDR`, binds, listens with a backlog of 1024 and
    /// registers for readability.
    pub async fn bind(selector: &Selector, addr: SocketAddr) -> Result<TcpListener, Error> {
        let socket = new_socket(addr, Type::STREAM, Protocol::TCP).map_err(Error::Os)?;
        socket.set_reuse_address(true).map_err(Error::Os)?;
        socket.bind(&addr.into()).map_err(Error::Os)?;
        socket.listen(1024).map_err(Error::Os)?;

        let channel = Channel::register(selector, socket.into(), Interest::READABLE).await?;
        Ok(TcpListener { channel })
    }

    /// Accepts a connection, suspending until one is pending.
    ///
    /// The accepted stream is non-blocking and registered with the same
    /// selector.
    pub async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), Error> {
        loop {
            let fd = self
                .channel
                .fd()
                .ok_or(Error::Internal("listener closed"))?
                .as_raw_fd();
            match accept(fd) {
                Ok(socket) => {
                    let peer = convert_address(socket.peer_addr().map_err(Error::Os)?)?;
                    let stream = TcpStream::from_socket(self.channel.selector(), socket).await?;
                    return Ok((stream, peer));
                }
                Err(ref err) if would_block(err) => {
                    let event = self.channel.await_ready(Interest::READABLE).await?;
                    self.channel.check_error_event(&event)?;
                }
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(Error::Os(err)),
            }
        }
    }

    /// Deregisters and closes the listener; idempotent.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.channel.close().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let fd = self.channel.fd().ok_or(Error::Internal("listener closed"))?;
        convert_address(SockRef::from(fd).local_addr().map_err(Error::Os)?)
    }
}

#[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn accept(listener: RawFd) -> std::io::Result<Socket> {
    let fd = syscall!(accept4(
        listener,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    // SAFETY: `accept4(2)` handed us this fd.
    Ok(unsafe { Socket::from_raw_fd(fd) })
}

/// Platforms without `accept4(2)`: accept, then set the flags.
#[cfg(any(
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "visionos",
    target_os = "watchos"
))]
fn accept(listener: RawFd) -> std::io::Result<Socket> {
    let fd = syscall!(accept(listener, std::ptr::null_mut(), std::ptr::null_mut()))?;
    // SAFETY: `accept(2)` handed us this fd; wrapping first makes the flag
    // calls below leak-safe.
    let socket = unsafe { Socket::from_raw_fd(fd) };
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener").finish_non_exhaustive()
    }
}
