//! Requests crossing from the coordinator to the poll thread, and the reply
//! records crossing back.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::waiter::WaiterCell;
use crate::{Interest, RegistrationId};

/// Key into the coordinator's pending-replies table.
pub(crate) type ReplyId = usize;

/// A request for the poll thread, queued on the MPSC request queue.
///
/// Register, modify and deregister round-trip through a reply record; arm is
/// fire-and-forget (errors are logged on the poll thread).
pub(crate) enum Request {
    Register {
        id: RegistrationId,
        fd: RawFd,
        interest: Interest,
        reply: ReplyId,
    },
    Modify {
        id: RegistrationId,
        interest: Interest,
        reply: ReplyId,
    },
    Deregister {
        id: RegistrationId,
        /// `None` for orphan cleanup, where nobody awaits the outcome.
        reply: Option<ReplyId>,
    },
    Arm {
        id: RegistrationId,
        interest: Interest,
    },
    /// Bulk removal during shutdown.
    DeregisterAll,
}

/// Failure shape of a reply record. The poll thread never raises driver
/// errors locally; they travel back through these.
#[derive(Debug)]
pub(crate) enum ReplyError {
    Os(io::Error),
    Shutdown,
}

pub(crate) type ReplyResult = Result<(), ReplyError>;

/// A slot in the pending-replies table.
pub(crate) struct PendingReply {
    pub(crate) cell: Arc<WaiterCell<ReplyResult>>,
    /// Registration to tear down if the awaiting future was dropped before
    /// a successful register reply landed.
    pub(crate) cleanup: Option<RegistrationId>,
}

/// Notice that a waiter was cancelled and should be drained by the dispatch
/// thread. Carries the cell itself so a replaced table slot is never drained
/// by mistake.
pub(crate) struct DrainNotice {
    pub(crate) id: RegistrationId,
    pub(crate) cell: Arc<WaiterCell<super::Resume>>,
}
