//! The shared socket facade: half-close tracking plus the arm-on-WouldBlock
//! retry discipline every socket type builds on.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use log::debug;

use crate::net::{interrupted, would_block};
use crate::sys::unix::syscall;
use crate::token::{Armed, Token};
use crate::{ArmError, Error, Event, Interest, RegistrationId, Selector};

/// Per-direction shutdown state. All bits are monotone; `closed` implies
/// both halves and that the registration was released.
#[derive(Clone, Copy, Default)]
struct HalfClose {
    read: bool,
    write: bool,
    closed: bool,
}

/// The registration capability as held between operations.
enum TokenSlot {
    Registering(Token<crate::token::Registering>),
    Armed(Token<Armed>),
    /// A dropped wait consumed the token. The registration is still ours;
    /// the next operation mints the armed capability again.
    Vacant,
}

/// A registered socket: selector handle, owned descriptor, capability and
/// half-close state. Move-only single owner.
pub(crate) struct Channel {
    selector: Selector,
    fd: Option<OwnedFd>,
    id: RegistrationId,
    token: TokenSlot,
    half_close: HalfClose,
}

impl Channel {
    /// Registers `fd` (already non-blocking) and wraps it.
    pub(crate) async fn register(
        selector: &Selector,
        fd: OwnedFd,
        interest: Interest,
    ) -> Result<Channel, Error> {
        let (id, token) = selector.register(fd.as_raw_fd(), interest).await?;
        Ok(Channel {
            selector: selector.clone(),
            fd: Some(fd),
            id,
            token: TokenSlot::Registering(token),
            half_close: HalfClose::default(),
        })
    }

    pub(crate) fn selector(&self) -> &Selector {
        &self.selector
    }

    pub(crate) fn fd(&self) -> Option<&OwnedFd> {
        self.fd.as_ref()
    }

    fn raw_fd(&self) -> Result<RawFd, Error> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::Internal("channel used after close"))
    }

    /// Takes the token, awaits readiness for `interest` and restores the
    /// token. Cancellation and timeouts restore it too; only shutdown
    /// forfeits it (the registration is gone by then).
    pub(crate) async fn await_ready(&mut self, interest: Interest) -> Result<Event, Error> {
        let arm = match mem::replace(&mut self.token, TokenSlot::Vacant) {
            TokenSlot::Registering(token) => self.selector.arm(token, interest),
            TokenSlot::Armed(token) => self.selector.arm(token, interest),
            TokenSlot::Vacant => self.selector.arm(Token::<Armed>::new(self.id), interest),
        };
        match arm.await {
            Ok((token, event)) => {
                self.token = TokenSlot::Armed(token);
                Ok(event)
            }
            Err(ArmError::Cancelled { token }) => {
                self.token = TokenSlot::Armed(token);
                Err(Error::Cancelled)
            }
            Err(ArmError::TimedOut { token }) => {
                self.token = TokenSlot::Armed(token);
                Err(Error::TimedOut)
            }
            Err(ArmError::ScopeMismatch { token }) => {
                self.token = TokenSlot::Armed(token);
                Err(Error::ScopeMismatch)
            }
            Err(err @ (ArmError::Shutdown | ArmError::Internal)) => Err(err.into()),
        }
    }

    /// Materializes an advisory error flag: fetches `SO_ERROR` and fails
    /// with it, unless the kernel reports nothing (or a spurious
    /// would-block), in which case the caller retries the syscall.
    pub(crate) fn check_error_event(&self, event: &Event) -> Result<(), Error> {
        if !event.is_error() {
            return Ok(());
        }
        match self.socket_error()? {
            None => {
                debug!("error flag without SO_ERROR on {:?}; retrying", self.id);
                Ok(())
            }
            Some(err) if would_block(&err) => Ok(()),
            Some(err) => Err(Error::Os(err)),
        }
    }

    /// `getsockopt(SO_ERROR)`, `None` when the kernel reports no error.
    pub(crate) fn socket_error(&self) -> Result<Option<io::Error>, Error> {
        let fd = self.raw_fd()?;
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))
        .map_err(Error::Os)?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    /// Reads into `buf`, returning 0 at EOF. Arms for readability on
    /// `WouldBlock`.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.half_close.read || self.half_close.closed {
            return Ok(0);
        }
        loop {
            let fd = self.raw_fd()?;
            match syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())) {
                Ok(0) => {
                    self.half_close.read = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n as usize),
                Err(ref err) if would_block(err) => {
                    let event = self.await_ready(Interest::READABLE).await?;
                    self.check_error_event(&event)?;
                }
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(Error::Os(err)),
            }
        }
    }

    /// Writes from `buf`, returning the (possibly partial) count. Arms for
    /// writability on `WouldBlock`; a 0-byte result on a non-empty buffer is
    /// treated the same way rather than looped on.
    pub(crate) async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.half_close.write || self.half_close.closed {
            return Err(Error::WriteClosed);
        }
        loop {
            let fd = self.raw_fd()?;
            match syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())) {
                Ok(0) => {
                    let event = self.await_ready(Interest::WRITABLE).await?;
                    self.check_error_event(&event)?;
                }
                Ok(n) => return Ok(n as usize),
                Err(ref err) if would_block(err) => {
                    let event = self.await_ready(Interest::WRITABLE).await?;
                    self.check_error_event(&event)?;
                }
                Err(ref err) if interrupted(err) => continue,
                Err(err) => return Err(Error::Os(err)),
            }
        }
    }

    /// Writes the whole of `buf`.
    pub(crate) async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Shuts down the read half. Idempotent.
    pub(crate) fn shutdown_read(&mut self) -> Result<(), Error> {
        if self.half_close.read || self.half_close.closed {
            return Ok(());
        }
        self.half_close.read = true;
        self.shutdown_syscall(libc::SHUT_RD)
    }

    /// Shuts down the write half. Idempotent; later writes fail typed.
    pub(crate) fn shutdown_write(&mut self) -> Result<(), Error> {
        if self.half_close.write || self.half_close.closed {
            return Ok(());
        }
        self.half_close.write = true;
        self.shutdown_syscall(libc::SHUT_WR)
    }

    fn shutdown_syscall(&self, how: libc::c_int) -> Result<(), Error> {
        let fd = self.raw_fd()?;
        match syscall!(shutdown(fd, how)) {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ENOTCONN) | Some(libc::EINVAL) | Some(libc::ENOTSOCK)
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(Error::Os(err)),
        }
    }

    /// Closes the channel: deregisters with the selector, then closes the
    /// descriptor. Idempotent. Deregistration precedes `close(2)` so the
    /// kernel event table never sees a recycled descriptor.
    pub(crate) async fn close(&mut self) -> Result<(), Error> {
        if self.half_close.closed {
            return Ok(());
        }
        self.half_close = HalfClose {
            read: true,
            write: true,
            closed: true,
        };

        let result = match mem::replace(&mut self.token, TokenSlot::Vacant) {
            TokenSlot::Registering(token) => self.selector.deregister(token).await,
            TokenSlot::Armed(token) => self.selector.deregister(token).await,
            TokenSlot::Vacant => {
                self.selector
                    .deregister(Token::<Armed>::new(self.id))
                    .await
            }
        };
        // Dropping the descriptor performs `close(2)`; EBADF is swallowed.
        self.fd = None;

        match result {
            Ok(()) => Ok(()),
            // The selector is tearing everything down in bulk.
            Err(Error::ShutdownInProgress) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Closed channels already deregistered. Anything else leaves through
        // the orphan path so neither the table entry nor the kernel
        // registration outlives the descriptor.
        if self.fd.is_some() {
            self.selector.drop_registration(self.id);
        }
    }
}
