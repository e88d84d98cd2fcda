use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::{Event, Interest, RegistrationId};

/// Kernel-visible wakeup object.
///
/// Breaks the poll thread out of a blocking [`Driver::poll`]. Backed by an
/// eventfd on epoll and a user event (or a pipe) on kqueue. Unlike every
/// other driver operation, waking is safe from any thread.
pub trait Wakeup: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

/// Contract over the OS readiness mechanism.
///
/// Implementations wrap epoll or kqueue. All operations except the
/// [`Wakeup`] handle are called only from the poll thread, which owns the
/// driver exclusively; dropping the driver closes the kernel object.
///
/// Required semantics:
///
/// - Registrations are one-shot (`EPOLLONESHOT`, `EV_DISPATCH`): after an
///   event fires, nothing is delivered for the registration until the next
///   [`arm`]. `register` arms the initial interest.
/// - Ids are allocated by the caller, stamped into the kernel object, and
///   carried back verbatim in events.
/// - [`poll`] blocks until the timeout, a registered event, or a wakeup;
///   `EINTR` is retried internally with the remaining timeout, and wakeup
///   events are acknowledged and filtered out of the output.
///
/// [`arm`]: Driver::arm
/// [`poll`]: Driver::poll
pub trait Driver: Send + 'static {
    /// Adds `fd` with `interest` armed one-shot under `id`.
    fn register(&mut self, id: RegistrationId, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Replaces the interest set of `id`, re-arming it one-shot.
    fn modify(&mut self, id: RegistrationId, interest: Interest) -> io::Result<()>;

    /// Re-arms `id` for `interest` after a delivered event.
    fn arm(&mut self, id: RegistrationId, interest: Interest) -> io::Result<()>;

    /// Removes `id`. A registration the kernel no longer knows about
    /// (`ENOENT`) is not an error.
    fn deregister(&mut self, id: RegistrationId) -> io::Result<()>;

    /// Removes every live registration, ignoring individual failures. Used
    /// by the poll thread's shutdown tail.
    fn deregister_all(&mut self);

    /// Blocks for events, appending translated ones to `events`. Returns the
    /// number appended, which may be zero on timeout or pure wakeup.
    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<usize>;

    /// The shared wakeup handle for this driver instance.
    fn wakeup(&self) -> Arc<dyn Wakeup>;
}
