//! Kernel-visible wakeup objects, one flavor per platform family.

/// Waker backed by `eventfd`.
///
/// `eventfd` is effectively an 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are converted (native endian) into an 64 bit
/// unsigned integer and added to the count. Reads must also be 8 bytes and
/// reset the count to 0, returning the count.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod eventfd {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

    use crate::driver::Wakeup;
    use crate::sys::unix::syscall;

    #[derive(Debug)]
    pub(crate) struct Waker {
        fd: File,
    }

    impl Waker {
        pub(crate) fn new() -> io::Result<Waker> {
            let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
            let file = unsafe { File::from_raw_fd(fd) };
            Ok(Waker { fd: file })
        }

        /// Drains the counter after the poll thread observed the wakeup.
        #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
        pub(crate) fn ack(&self) {
            let mut buf: [u8; 8] = 0u64.to_ne_bytes();
            let _ = (&self.fd).read(&mut buf);
        }
    }

    impl Wakeup for Waker {
        #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
        fn wake(&self) -> io::Result<()> {
            let buf: [u8; 8] = 1u64.to_ne_bytes();
            match (&self.fd).write(&buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Writing only blocks if the counter is going to
                    // overflow, so drain it and wake again.
                    self.ack();
                    self.wake()
                }
                Err(err) => Err(err),
            }
        }
    }

    impl AsRawFd for Waker {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

/// Waker backed by a kqueue user event (`EVFILT_USER`).
#[cfg(any(
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "visionos",
    target_os = "watchos",
))]
pub(crate) mod kevent {
    use std::io;
    use std::os::unix::io::{AsRawFd, OwnedFd};

    use crate::driver::Wakeup;

    /// Identifier of the user event inside the kqueue.
    pub(crate) const WAKER_IDENT: usize = 0;

    #[derive(Debug)]
    pub(crate) struct Waker {
        // Own dup of the kqueue fd so `wake` works from any thread while the
        // poll thread owns the driver.
        kq: OwnedFd,
    }

    impl Waker {
        pub(crate) fn new(kq: &OwnedFd) -> io::Result<Waker> {
            let kq = kq.try_clone()?;
            let mut kevent = libc::kevent {
                ident: WAKER_IDENT,
                filter: libc::EVFILT_USER,
                flags: libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            let n = unsafe { libc::kevent(kq.as_raw_fd(), &kevent, 1, &mut kevent, 1, std::ptr::null()) };
            if n == -1 {
                return Err(io::Error::last_os_error());
            }
            if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
                return Err(io::Error::from_raw_os_error(kevent.data as i32));
            }
            Ok(Waker { kq })
        }
    }

    impl Wakeup for Waker {
        fn wake(&self) -> io::Result<()> {
            let mut kevent = libc::kevent {
                ident: WAKER_IDENT,
                filter: libc::EVFILT_USER,
                flags: libc::EV_ADD | libc::EV_RECEIPT,
                fflags: libc::NOTE_TRIGGER,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            let n = unsafe { libc::kevent(self.kq.as_raw_fd(), &kevent, 1, &mut kevent, 1, std::ptr::null()) };
            if n == -1 {
                return Err(io::Error::last_os_error());
            }
            if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
                return Err(io::Error::from_raw_os_error(kevent.data as i32));
            }
            Ok(())
        }
    }
}

/// Waker backed by a non-blocking pipe, for kqueue platforms without
/// `EVFILT_USER`.
#[cfg(any(target_os = "dragonfly", target_os = "netbsd", target_os = "openbsd"))]
pub(crate) mod pipe {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

    use crate::driver::Wakeup;
    use crate::sys::unix::syscall;

    #[derive(Debug)]
    pub(crate) struct Waker {
        sender: File,
        receiver: File,
    }

    impl Waker {
        pub(crate) fn new() -> io::Result<Waker> {
            let mut fds = [-1; 2];
            syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
            Ok(Waker {
                sender: unsafe { File::from_raw_fd(fds[1]) },
                receiver: unsafe { File::from_raw_fd(fds[0]) },
            })
        }

        /// Drains the pipe after the poll thread observed the wakeup.
        pub(crate) fn ack(&self) {
            let mut buf = [0u8; 4096];
            loop {
                match (&self.receiver).read(&mut buf) {
                    Ok(n) if n > 0 => continue,
                    _ => return,
                }
            }
        }

        /// The read end, registered with the kqueue.
        pub(crate) fn as_raw_fd(&self) -> RawFd {
            self.receiver.as_raw_fd()
        }
    }

    impl Wakeup for Waker {
        fn wake(&self) -> io::Result<()> {
            match (&self.sender).write(&[1]) {
                Ok(_) => Ok(()),
                // The pipe is full, the poll thread will wake anyway.
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => Err(err),
            }
        }
    }
}
