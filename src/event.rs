use std::{fmt, ops};

use crate::{Interest, RegistrationId};

/// Condition flags carried by an [`Event`] alongside the ready set.
///
/// Flags are hints about the state of the descriptor, not readiness classes.
/// [`ERROR`] in particular means "consult the socket's pending error via
/// `SO_ERROR`"; it does not itself carry the errno.
///
/// [`ERROR`]: EventFlags::ERROR
#[derive(Copy, Clone, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct EventFlags(u8);

const ERROR: u8 = 0b001;
const HANGUP: u8 = 0b010;
const READ_HANGUP: u8 = 0b100;

impl EventFlags {
    /// The empty flag set.
    pub const fn empty() -> EventFlags {
        EventFlags(0)
    }

    /// The descriptor has a pending error; fetch it with `SO_ERROR`.
    pub const ERROR: EventFlags = EventFlags(ERROR);

    /// Both halves of the connection have closed.
    pub const HANGUP: EventFlags = EventFlags(HANGUP);

    /// The peer shut down its write half; reads will observe EOF once
    /// buffered data is drained.
    pub const READ_HANGUP: EventFlags = EventFlags(READ_HANGUP);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: EventFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for EventFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        EventFlags(self.0 | other.0)
    }
}

impl ops::BitOrAssign for EventFlags {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "(empty)");
        }
        let mut one = false;
        for (bit, name) in [
            (EventFlags::ERROR, "ERROR"),
            (EventFlags::HANGUP, "HANGUP"),
            (EventFlags::READ_HANGUP, "READ_HANGUP"),
        ] {
            if self.contains(bit) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", name)?;
                one = true
            }
        }
        Ok(())
    }
}

/// A readiness event for a single registration.
///
/// Events are produced by the driver on the poll thread and routed by the
/// selector to the waiter armed for the registration, or stored as permits
/// when no waiter is armed. The `ready` set may be a superset of the interest
/// that was armed; the `flags` describe error and hang-up conditions observed
/// by the kernel.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Event {
    id: RegistrationId,
    ready: Interest,
    flags: EventFlags,
}

impl Event {
    pub(crate) fn new(id: RegistrationId, ready: Interest, flags: EventFlags) -> Event {
        Event { id, ready, flags }
    }

    /// The registration this event belongs to.
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// The set of interest classes that became ready.
    pub fn ready(&self) -> Interest {
        self.ready
    }

    /// The condition flags observed with the readiness.
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn is_readable(&self) -> bool {
        self.ready.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.ready.is_writable()
    }

    pub fn is_priority(&self) -> bool {
        self.ready.is_priority()
    }

    /// Returns true if the descriptor carries a pending error.
    ///
    /// The errno is not part of the event; fetch it with
    /// `getsockopt(SO_ERROR)`.
    pub fn is_error(&self) -> bool {
        self.flags.contains(EventFlags::ERROR)
    }

    pub fn is_hangup(&self) -> bool {
        self.flags.contains(EventFlags::HANGUP)
    }

    pub fn is_read_hangup(&self) -> bool {
        self.flags.contains(EventFlags::READ_HANGUP)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("ready", &self.ready)
            .field("flags", &self.flags)
            .finish()
    }
}
