use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use socket2::{Protocol, SockAddr, SockRef, Type};

use crate::net::channel::Channel;
use crate::net::{convert_address, interrupted, new_socket, would_block};
use crate::sys::unix::syscall;
use crate::{Error, Interest, Selector};

/// A non-blocking UDP socket driven by a [`Selector`].
///
/// Datagrams are sent with [`send_to`] and received with [`recv_from`].
/// After [`connect`] the peer is fixed by the kernel and [`send`]/[`recv`]
/// apply; a zero-length datagram is a valid receipt, not EOF.
///
/// [`send_to`]: UdpSocket::send_to
/// [`recv_from`]: UdpSocket::recv_from
/// [`connect`]: UdpSocket::connect
/// [`send`]: UdpSocket::send
/// [`recv`]: UdpSocket::recv
pub struct UdpSocket {
    channel: Channel,
}

impl UdpSocket {
    /// Binds a socket to `addr` and registers it for both data directions.
    pub async fn bind(selector: &Selector, addr: SocketAddr) -> Result<UdpSocket, Error> {
        let socket = new_socket(addr, Type::DGRAM, Protocol::UDP).map_err(Error::Os)?;
        socket.bind(&addr.into()).map_err(Error::Os)?;

        let channel = Channel::register(
            selector,
            socket.into(),
            Interest::READABLE | Interest::WRITABLE,
        )
        .await?;
        Ok(UdpSocket { channel })
    }

    /// Sends a datagram to `target`.
    pub async fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> Result<usize, Error> {
        let target = SockAddr::from(target);
        loop {
            let result = {
                let fd = self.channel.fd().ok_or(Error::Internal("socket closed"))?;
                SockRef::from(fd).send_to(buf, &target)
            };
            match result {
                Ok(n) => return Ok(n),
                Err(ref err) if would_block(err) => {
                    let event = self.channel.await_ready(Interest::WRITABLE).await?;
                    self.channel.check_error_event(&event)?;
                }
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(Error::Os(err)),
            }
        }
    }

    /// Receives a datagram, returning the byte count and the sender.
    pub async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        loop {
            let fd = self
                .channel
                .fd()
                .ok_or(Error::Internal("socket closed"))?
                .as_raw_fd();
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut addr_len = mem::size_of_val(&storage) as libc::socklen_t;
            match syscall!(recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )) {
                Ok(n) => {
                    // SAFETY: `recvfrom(2)` initialized `addr_len` bytes of
                    // the storage.
                    let addr = unsafe { SockAddr::new(storage, addr_len) };
                    return Ok((n as usize, convert_address(addr)?));
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

    /// Fixes the peer address; afterwards [`send`]/[`recv`] apply and the
    /// kernel filters out datagrams from other sources.
    ///
    /// [`send`]: UdpSocket::send
    /// [`recv`]: UdpSocket::recv
    pub fn connect(&self, peer: SocketAddr) -> Result<(), Error> {
        let fd = self.channel.fd().ok_or(Error::Internal("socket closed"))?;
        SockRef::from(fd).connect(&peer.into()).map_err(Error::Os)
    }

    /// Sends to the connected peer.
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        loop {
            let fd = self
                .channel
                .fd()
                .ok_or(Error::Internal("socket closed"))?
                .as_raw_fd();
            match syscall!(send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0)) {
                Ok(n) => return Ok(n as usize),
                Err(ref err) if would_block(err) => {
                    let event = self.channel.await_ready(Interest::WRITABLE).await?;
                    self.channel.check_error_event(&event)?;
                }
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(Error::Os(err)),
            }
        }
    }

    /// Receives from the connected peer.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            let fd = self
                .channel
                .fd()
                .ok_or(Error::Internal("socket closed"))?
                .as_raw_fd();
            match syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)) {
                Ok(n) => return Ok(n as usize),
                Err(ref err) if would_block(err) => {
                    let event = self.channel.await_ready(Interest::READABLE).await?;
                    self.channel.check_error_event(&event)?;
                }
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(Error::Os(err)),
            }
        }
    }

    /// Deregisters and closes the socket; idempotent.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.channel.close().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let fd = self.channel.fd().ok_or(Error::Internal("socket closed"))?;
        convert_address(SockRef::from(fd).local_addr().map_err(Error::Os)?)
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket").finish_non_exhaustive()
    }
}
