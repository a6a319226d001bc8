//! Status taxonomy shared by every kernel service.
//!
//! Every operation on a kernel object resolves to `Ok(..)` or to exactly one
//! [`KernelError`] kind. The kinds split into two classes:
//!
//! - *expected* outcomes (`WouldBlock`, `Timeout`, `NoEvents`, `Deleted`,
//!   `WaitAborted`, `Terminated`) are ordinary control flow for blocking
//!   protocols and are never logged as errors;
//! - *failures* (everything else) are logged at ERROR severity with the
//!   object's name and the numeric status code before being returned.
//!
//! The numeric codes are stable and appear verbatim in log lines, so tooling
//! that greps `= 0xNN` keeps working across releases.

use thiserror::Error;

/// Result alias used across the crate.
pub type KernelResult<T> = Result<T, KernelError>;

/// Status kinds returned by kernel-object operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A no-wait request found the object unavailable.
    #[error("operation would block")]
    WouldBlock,
    /// A timed wait expired before the object became available.
    #[error("wait timed out")]
    Timeout,
    /// Requested event flags were not present on a no-wait get.
    #[error("requested events not present")]
    NoEvents,
    /// The object was deleted while the caller was suspended on it.
    #[error("object deleted while waiting")]
    Deleted,
    /// The wait was cancelled by an external wait-abort request.
    #[error("wait aborted")]
    WaitAborted,
    /// The increment would have pushed the count past the ceiling.
    #[error("count would exceed ceiling")]
    CeilingExceeded,
    /// The calling thread was terminated while inside a kernel service.
    #[error("calling thread terminated")]
    Terminated,
    /// Operation requires kernel registration but the object has none.
    #[error("object not created")]
    NotCreated,
    /// A size, count, or option argument was out of range.
    #[error("invalid parameter")]
    InvalidParameter,
    /// Another live object of the same kind already uses this name.
    #[error("name already registered")]
    DuplicateName,
    /// The kernel's object registry is at capacity.
    #[error("object registry full")]
    RegistryFull,
    /// The pool does not recognize the block being released.
    #[error("block does not belong to this pool")]
    UnknownBlock,
    /// The operation is not valid in the object's current state.
    #[error("operation invalid in current state")]
    InvalidState,
    /// Wait-abort was requested but the thread is not suspended on anything.
    #[error("thread is not waiting")]
    NotWaiting,
    /// The thread has finished or already carries a rendezvous hook.
    #[error("thread is not joinable")]
    NotJoinable,
    /// Joining the current thread would block it on its own exit.
    #[error("self-join would deadlock")]
    DeadlockAvoided,
    /// No memory was available: pool exhausted, or a host thread could not
    /// be spawned.
    #[error("out of memory")]
    NoMemory,
}

impl KernelError {
    /// Stable numeric status code, carried in every ERROR log line.
    pub const fn code(self) -> u32 {
        match self {
            KernelError::WouldBlock => 0x01,
            KernelError::Timeout => 0x02,
            KernelError::NoEvents => 0x03,
            KernelError::Deleted => 0x04,
            KernelError::WaitAborted => 0x05,
            KernelError::CeilingExceeded => 0x06,
            KernelError::Terminated => 0x07,
            KernelError::NotCreated => 0x10,
            KernelError::InvalidParameter => 0x11,
            KernelError::DuplicateName => 0x12,
            KernelError::RegistryFull => 0x13,
            KernelError::UnknownBlock => 0x14,
            KernelError::InvalidState => 0x15,
            KernelError::NotWaiting => 0x16,
            KernelError::NotJoinable => 0x17,
            KernelError::DeadlockAvoided => 0x18,
            KernelError::NoMemory => 0x19,
        }
    }

    /// Whether this kind is ordinary blocking-protocol control flow.
    ///
    /// Expected kinds are returned to the caller without an ERROR log line.
    pub const fn is_expected(self) -> bool {
        matches!(
            self,
            KernelError::WouldBlock
                | KernelError::Timeout
                | KernelError::NoEvents
                | KernelError::Deleted
                | KernelError::WaitAborted
                | KernelError::Terminated
        )
    }
}
