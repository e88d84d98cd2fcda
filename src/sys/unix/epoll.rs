use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::driver::{Driver, Wakeup};
use crate::event::EventFlags;
use crate::sys::unix::syscall;
use crate::sys::unix::waker::eventfd;
use crate::{Event, Interest, RegistrationId};

/// Maximum number of kernel events fetched per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Marker stamped on the wakeup eventfd's epoll data.
const WAKE_DATA: u64 = u64::MAX;

/// Readiness driver backed by `epoll(7)`, one-shot via `EPOLLONESHOT`.
pub(crate) struct OsDriver {
    ep: OwnedFd,
    waker: Arc<eventfd::Waker>,
    /// id -> fd, needed for `epoll_ctl` on modify/deregister and for the
    /// shutdown sweep.
    registered: HashMap<u64, RawFd>,
    buffer: Vec<libc::epoll_event>,
}

impl OsDriver {
    pub(crate) fn new() -> io::Result<OsDriver> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };

        let waker = Arc::new(eventfd::Waker::new()?);
        let mut event = libc::epoll_event {
            events: (EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKE_DATA,
        };
        syscall!(epoll_ctl(
            ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.as_raw_fd(),
            &mut event,
        ))?;

        Ok(OsDriver {
            ep,
            waker,
            registered: HashMap::new(),
            buffer: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, id: RegistrationId, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: id.as_u64(),
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
    }

    fn fd_of(&self, id: RegistrationId) -> io::Result<RawFd> {
        self.registered
            .get(&id.as_u64())
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }
}

impl Driver for OsDriver {
    fn register(&mut self, id: RegistrationId, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, id, interest)?;
        self.registered.insert(id.as_u64(), fd);
        Ok(())
    }

    fn modify(&mut self, id: RegistrationId, interest: Interest) -> io::Result<()> {
        let fd = self.fd_of(id)?;
        self.ctl(libc::EPOLL_CTL_MOD, fd, id, interest)
    }

    fn arm(&mut self, id: RegistrationId, interest: Interest) -> io::Result<()> {
        let fd = self.fd_of(id)?;
        self.ctl(libc::EPOLL_CTL_MOD, fd, id, interest)
    }

    fn deregister(&mut self, id: RegistrationId) -> io::Result<()> {
        let fd = match self.registered.remove(&id.as_u64()) {
            Some(fd) => fd,
            None => return Ok(()),
        };
        match syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        )) {
            Ok(_) => Ok(()),
            // The kernel already dropped the registration, e.g. because the
            // fd was closed first.
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(ref err) if err.raw_os_error() == Some(libc::EBADF) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn deregister_all(&mut self) {
        for (_, fd) in self.registered.drain() {
            let _ = syscall!(epoll_ctl(
                self.ep.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            ));
        }
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<usize> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let n_events = loop {
            let millis = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // `Duration::as_millis` truncates, so round up. This
                    // avoids turning sub-millisecond timeouts into a zero
                    // timeout, unless the remaining time actually is zero.
                    if remaining.is_zero() {
                        0
                    } else {
                        remaining
                            .checked_add(Duration::from_nanos(999_999))
                            .unwrap_or(remaining)
                            .as_millis() as libc::c_int
                    }
                }
                None => -1,
            };

            self.buffer.clear();
            match syscall!(epoll_wait(
                self.ep.as_raw_fd(),
                self.buffer.as_mut_ptr(),
                self.buffer.capacity() as libc::c_int,
                millis,
            )) {
                // This is safe because `epoll_wait` ensures that `n` events
                // are assigned.
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
            // Copies, not references: `epoll_event` is packed on some
            // targets.
            let data = raw.u64;
            let kinds = raw.events as libc::c_int;
            if data == WAKE_DATA {
                self.waker.ack();
                continue;
            }
            if !self.registered.contains_key(&data) {
                // Deregistered earlier in this cycle; the event is stale.
                continue;
            }
            events.push(translate(RegistrationId::from_u64(data), kinds));
            pushed += 1;
        }
        Ok(pushed)
    }

    fn wakeup(&self) -> Arc<dyn Wakeup> {
        self.waker.clone()
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = EPOLLONESHOT;

    if interest.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_priority() {
        kind |= EPOLLPRI;
    }

    kind as u32
}

fn translate(id: RegistrationId, events: libc::c_int) -> Event {
    let mut ready = None;
    let mut add = |class: Interest| {
        ready = Some(match ready {
            Some(current) => current | class,
            None => class,
        });
    };

    if events & EPOLLIN != 0 || events & EPOLLRDHUP != 0 {
        add(Interest::READABLE);
    }
    if events & EPOLLOUT != 0 {
        add(Interest::WRITABLE);
    }
    if events & EPOLLPRI != 0 {
        add(Interest::PRIORITY);
    }

    let mut flags = EventFlags::empty();
    if events & EPOLLERR != 0 {
        flags |= EventFlags::ERROR;
    }
    if events & EPOLLHUP != 0 {
        flags |= EventFlags::HANGUP;
    }
    if events & EPOLLRDHUP != 0 {
        flags |= EventFlags::READ_HANGUP;
    }

    // An error or hang-up can be reported without any subscribed readiness
    // bit; substitute both data classes so an armed waiter observes it.
    let ready = ready.unwrap_or(Interest::READABLE | Interest::WRITABLE);
    Event::new(id, ready, flags)
}
