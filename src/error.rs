use std::io;

use thiserror::Error;

use crate::token::{Armed, Token};

/// Errors surfaced by selector operations, channels and the resource pool.
///
/// Operating-system failures are carried verbatim in [`Error::Os`]; the
/// remaining variants are produced by this crate. Lifecycle outcomes
/// (`ShutdownInProgress`, `Cancelled`, `TimedOut`) take precedence over
/// operational failures when both apply.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operating-system error, errno preserved.
    #[error(transparent)]
    Os(#[from] io::Error),

    /// The selector is shutting down or already shut down.
    #[error("selector is shutting down")]
    ShutdownInProgress,

    /// The waiting operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The deadline passed before readiness arrived.
    #[error("operation timed out")]
    TimedOut,

    /// The write half of the channel was shut down.
    #[error("write half of the channel is closed")]
    WriteClosed,

    /// The id names no live registration or pool entry.
    #[error("unknown registration or pool id")]
    InvalidId,

    /// The id was minted by a different selector.
    #[error("id belongs to a different selector")]
    ScopeMismatch,

    /// The pool entry's waiter queue is at capacity.
    #[error("pool waiter queue is full")]
    WaitersFull,

    /// A caller contract was broken; degraded from a debug assertion.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl Error {
    /// The raw OS error code, when this is a platform error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Os(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

/// Outcome of an [`arm`] that did not deliver an event.
///
/// Cancellation and deadline expiry do not destroy the registration, so those
/// variants return the armed token to the caller for re-arming or
/// deregistration. Shutdown releases every registration, so no token
/// survives it.
///
/// [`arm`]: crate::Selector::arm
#[derive(Debug, Error)]
pub enum ArmError {
    /// The waiter was cancelled; the registration is still live.
    #[error("arm cancelled")]
    Cancelled {
        /// The recovered capability over the registration.
        token: Token<Armed>,
    },

    /// The deadline passed; the registration is still live.
    #[error("arm timed out")]
    TimedOut {
        /// The recovered capability over the registration.
        token: Token<Armed>,
    },

    /// The selector is shutting down; the registration is released.
    #[error("selector is shutting down")]
    Shutdown,

    /// The token was minted by a different selector; it stays valid there.
    #[error("token belongs to a different selector")]
    ScopeMismatch {
        /// The capability, untouched.
        token: Token<Armed>,
    },

    /// A caller contract was broken; degraded from a debug assertion.
    #[error("internal invariant violated")]
    Internal,
}

impl From<ArmError> for Error {
    fn from(err: ArmError) -> Error {
        match err {
            ArmError::Cancelled { .. } => Error::Cancelled,
            ArmError::TimedOut { .. } => Error::TimedOut,
            ArmError::Shutdown => Error::ShutdownInProgress,
            ArmError::ScopeMismatch { .. } => Error::ScopeMismatch,
            ArmError::Internal => Error::Internal("arm state"),
        }
    }
}
