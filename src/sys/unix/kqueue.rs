use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{cmp, ptr};

use crate::driver::{Driver, Wakeup};
use crate::event::EventFlags;
use crate::sys::unix::syscall;
use crate::{Event, Interest, RegistrationId};

#[cfg(any(
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "visionos",
    target_os = "watchos",
))]
use crate::sys::unix::waker::kevent as waker;
#[cfg(any(target_os = "dragonfly", target_os = "netbsd", target_os = "openbsd"))]
use crate::sys::unix::waker::pipe as waker;

/// Maximum number of kernel events fetched per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Marker stamped on wakeup events.
const WAKE_DATA: u64 = u64::MAX;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "visionos",
    target_os = "watchos"
))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Flags = libc::c_ushort;
#[cfg(any(
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "visionos",
    target_os = "watchos"
))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

// Type of the `data` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "tvos",
    target_os = "visionos",
    target_os = "watchos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            fflags: 0,
            data: 0,
            udata: $data as usize as UData,
        }
    };
}

/// Readiness driver backed by `kqueue(2)`, one-shot via `EV_DISPATCH`.
///
/// kqueue has no priority filter; [`Interest::PRIORITY`] degrades to a no-op
/// here.
pub(crate) struct OsDriver {
    kq: OwnedFd,
    waker: Arc<waker::Waker>,
    /// id -> fd, needed for kevent changes on modify/deregister and for the
    /// shutdown sweep.
    registered: HashMap<u64, RawFd>,
    buffer: Vec<libc::kevent>,
}

impl OsDriver {
    pub(crate) fn new() -> io::Result<OsDriver> {
        let kq = syscall!(kqueue())
            .and_then(|kq| syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| kq))?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };

        #[cfg(any(
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "visionos",
            target_os = "watchos",
        ))]
        let waker = Arc::new(waker::Waker::new(&kq)?);

        #[cfg(any(target_os = "dragonfly", target_os = "netbsd", target_os = "openbsd"))]
        let waker = {
            let waker = Arc::new(waker::Waker::new()?);
            let mut changes =
                [kevent!(waker.as_raw_fd(), libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR, WAKE_DATA)];
            kevent_register(kq.as_raw_fd(), &mut changes, &[])?;
            waker
        };

        Ok(OsDriver {
            kq,
            waker,
            registered: HashMap::new(),
            buffer: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    fn fd_of(&self, id: RegistrationId) -> io::Result<RawFd> {
        self.registered
            .get(&id.as_u64())
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    /// Applies `flags` per interest class; classes outside `interest` are
    /// deleted when `delete_others` is set (the modify path).
    fn change(
        &mut self,
        fd: RawFd,
        id: RegistrationId,
        interest: Interest,
        flags: Flags,
        delete_others: bool,
    ) -> io::Result<()> {
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);

        if interest.is_readable() {
            changes.push(kevent!(fd, libc::EVFILT_READ, flags, id.as_u64()));
        } else if delete_others {
            changes.push(kevent!(
                fd,
                libc::EVFILT_READ,
                libc::EV_DELETE | libc::EV_RECEIPT,
                id.as_u64()
            ));
        }

        if interest.is_writable() {
            changes.push(kevent!(fd, libc::EVFILT_WRITE, flags, id.as_u64()));
        } else if delete_others {
            changes.push(kevent!(
                fd,
                libc::EVFILT_WRITE,
                libc::EV_DELETE | libc::EV_RECEIPT,
                id.as_u64()
            ));
        }

        // Older versions of macOS can return EPIPE when registering a pipe
        // file descriptor where the other end has already disappeared, while
        // still reporting events for it. ENOENT informs us a filter we tried
        // to remove was not there in the first place.
        kevent_register(
            self.kq.as_raw_fd(),
            &mut changes,
            &[libc::ENOENT as Data, libc::EPIPE as Data],
        )
    }
}

impl Driver for OsDriver {
    fn register(&mut self, id: RegistrationId, fd: RawFd, interest: Interest) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_RECEIPT | libc::EV_DISPATCH;
        self.change(fd, id, interest, flags as Flags, false)?;
        self.registered.insert(id.as_u64(), fd);
        Ok(())
    }

    fn modify(&mut self, id: RegistrationId, interest: Interest) -> io::Result<()> {
        let fd = self.fd_of(id)?;
        let flags = libc::EV_ADD | libc::EV_RECEIPT | libc::EV_DISPATCH;
        self.change(fd, id, interest, flags as Flags, true)
    }

    fn arm(&mut self, id: RegistrationId, interest: Interest) -> io::Result<()> {
        let fd = self.fd_of(id)?;
        let flags = libc::EV_ADD | libc::EV_RECEIPT | libc::EV_DISPATCH | libc::EV_ENABLE;
        self.change(fd, id, interest, flags as Flags, false)
    }

    fn deregister(&mut self, id: RegistrationId) -> io::Result<()> {
        let fd = match self.registered.remove(&id.as_u64()) {
            Some(fd) => fd,
            None => return Ok(()),
        };
        let mut changes = [
            kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE | libc::EV_RECEIPT, 0),
            kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE | libc::EV_RECEIPT, 0),
        ];
        // Remove both filters and ignore ENOENT: there is no way to check
        // with which interest the fd was registered.
        kevent_register(
            self.kq.as_raw_fd(),
            &mut changes,
            &[libc::ENOENT as Data, libc::EBADF as Data],
        )
    }

    fn deregister_all(&mut self) {
        let kq = self.kq.as_raw_fd();
        for (_, fd) in self.registered.drain() {
            let mut changes = [
                kevent!(fd, libc::EVFILT_WRITE, libc::EV_DELETE | libc::EV_RECEIPT, 0),
                kevent!(fd, libc::EVFILT_READ, libc::EV_DELETE | libc::EV_RECEIPT, 0),
            ];
            let _ = kevent_register(kq, &mut changes, &[]);
        }
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let n_events = loop {
            let timespec = deadline.map(|deadline| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                libc::timespec {
                    tv_sec: cmp::min(remaining.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
                    // `Duration::subsec_nanos` is guaranteed to be less than
                    // one billion, making the cast safe.
                    tv_nsec: libc::c_long::from(remaining.subsec_nanos() as i32),
                }
            });
            let timespec_ptr = timespec
                .as_ref()
                .map(|timespec| timespec as *const _)
                .unwrap_or(ptr::null());

            self.buffer.clear();
            match syscall!(kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.buffer.as_mut_ptr(),
                self.buffer.capacity() as Count,
                timespec_ptr,
            )) {
                // This is safe because `kevent` ensures that `n` events are
                // assigned.
                Ok(n) => {
                    unsafe { self.buffer.set_len(n as usize) };
                    break n as usize;
                }
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        };

        let mut pushed = 0;
        for raw in self.buffer.iter().take(n_events) {
            #[cfg(any(
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "tvos",
                target_os = "visionos",
                target_os = "watchos",
            ))]
            if raw.filter == libc::EVFILT_USER as Filter {
                // EV_CLEAR resets the user event for us.
                continue;
            }

            let raw_id = raw.udata as usize as u64;
            if raw_id == WAKE_DATA {
                #[cfg(any(target_os = "dragonfly", target_os = "netbsd", target_os = "openbsd"))]
                self.waker.ack();
                continue;
            }

            let id = RegistrationId::from_u64(raw_id);
            if !self.registered.contains_key(&raw_id) {
                // Deregistered earlier in this cycle; the event is stale.
                continue;
            }
            events.push(translate(id, raw));
            pushed += 1;
        }
        Ok(pushed)
    }

    fn wakeup(&self) -> Arc<dyn Wakeup> {
        self.waker.clone()
    }
}

/// Register `changes` with the kqueue, using `EV_RECEIPT` per-change error
/// reporting and treating the errnos in `ignored_errors` as success.
fn kevent_register(
    kq: RawFd,
    changes: &mut [libc::kevent],
    ignored_errors: &[Data],
) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| {
        // According to the manual page of FreeBSD: "When kevent() call fails
        // with EINTR error, all changes in the changelist have been applied",
        // so we can safely ignore it.
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(())
        } else {
            Err(err)
        }
    })
    .and_then(|()| check_errors(changes, ignored_errors))
}

/// Checks for per-change errors reported via `EV_ERROR` receipts.
fn check_errors(events: &[libc::kevent], ignored_errors: &[Data]) -> io::Result<()> {
    for event in events {
        // We can't use references to packed structures (in checking the
        // ignored errors), so we need copies of the data.
        let data = event.data as Data;
        if (event.flags as Flags & libc::EV_ERROR as Flags) != 0
            && data != 0
            && !ignored_errors.contains(&data)
        {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}

fn translate(id: RegistrationId, raw: &libc::kevent) -> Event {
    let mut flags = EventFlags::empty();

    let eof = raw.flags as Flags & libc::EV_EOF as Flags != 0;
    let error = raw.flags as Flags & libc::EV_ERROR as Flags != 0 || (eof && raw.fflags != 0);
    if error {
        flags |= EventFlags::ERROR;
    }

    let ready = match raw.filter as Filter {
        f if f == libc::EVFILT_READ as Filter => {
            if eof {
                flags |= EventFlags::READ_HANGUP;
            }
            Interest::READABLE
        }
        f if f == libc::EVFILT_WRITE as Filter => {
            if eof {
                flags |= EventFlags::HANGUP;
            }
            Interest::WRITABLE
        }
        // Unknown filter; wake both data classes so nothing is lost.
        _ => Interest::READABLE | Interest::WRITABLE,
    };

    Event::new(id, ready, flags)
}
