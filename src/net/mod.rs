//! Networking primitives.
//!
//! The types in this module own their socket, keep it registered with a
//! [`Selector`] and retry non-blocking syscalls by arming for readiness on
//! `WouldBlock`. They are single-owner: one in-flight read and one in-flight
//! write at a time per socket (v1 serialization constraint, enforced by
//! `&mut self`).
//!
//! [`Selector`]: crate::Selector

mod channel;
mod tcp;
mod udp;

pub use self::tcp::{TcpListener, TcpStream};
pub use self::udp::UdpSocket;

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::Error;

pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Creates a non-blocking socket for `addr`'s family.
pub(crate) fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let domain = Domain::for_address(addr);
    // Use `SOCK_NONBLOCK` on platforms that support it.
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let ty = ty.nonblocking();
    let socket = Socket::new(domain, ty, Some(protocol))?;
    // Platforms that don't support `SOCK_NONBLOCK`.
    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    socket.set_nonblocking(true)?;
    Ok(socket)
}

pub(crate) fn convert_address(addr: socket2::SockAddr) -> Result<SocketAddr, Error> {
    addr.as_socket()
        .ok_or(Error::Internal("non-inet socket address"))
}
