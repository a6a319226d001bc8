//! One-shot park/wake cells backing every suspension.
//!
//! A [`ParkCell`] is claimed exactly once: the first of a grant, a deletion,
//! an abort, a termination, or the parker's own timeout wins, and every later
//! claim attempt reports failure. Wakers use that report to move on to the
//! next waiter instead of losing a token to a thread that already timed out.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Why a parked thread woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeStatus {
    /// The object delivered (token, satisfied flags, message, ...).
    Granted,
    /// The deadline passed with no grant.
    TimedOut,
    /// The object was deleted out from under the waiter.
    Deleted,
    /// An external wait-abort cancelled the wait.
    Aborted,
    /// The waiting thread was terminated.
    Terminated,
}

enum CellState<P> {
    Waiting,
    Woken(WakeStatus, Option<P>),
}

/// Single-use rendezvous between one parked thread and its waker.
pub(crate) struct ParkCell<P> {
    state: Mutex<CellState<P>>,
    cond: Condvar,
}

impl<P> ParkCell<P> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState::Waiting),
            cond: Condvar::new(),
        })
    }

    /// Claim the cell. Returns false if it was already claimed, in which
    /// case `payload` is dropped and the waker should pick another waiter.
    pub(crate) fn wake(&self, status: WakeStatus, payload: Option<P>) -> bool {
        let mut state = self.state.lock();
        match *state {
            CellState::Waiting => {
                *state = CellState::Woken(status, payload);
                self.cond.notify_one();
                true
            }
            CellState::Woken(..) => false,
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), CellState::Waiting)
    }

    /// Block until the cell is claimed. A `deadline` of `None` waits forever.
    ///
    /// A timeout claims the cell itself, so a grant racing the deadline
    /// resolves atomically under the cell lock: whichever lands first is the
    /// outcome both sides observe.
    pub(crate) fn park(&self, deadline: Option<Instant>) -> (WakeStatus, Option<P>) {
        let mut state = self.state.lock();
        loop {
            match &mut *state {
                CellState::Woken(status, payload) => return (*status, payload.take()),
                CellState::Waiting => match deadline {
                    Some(at) => {
                        if self.cond.wait_until(&mut state, at).timed_out()
                            && matches!(*state, CellState::Waiting)
                        {
                            *state = CellState::Woken(WakeStatus::TimedOut, None);
                        }
                    }
                    None => self.cond.wait(&mut state),
                },
            }
        }
    }
}

/// Type-erased view of a cell, held by a thread's control block so that
/// wait-abort and terminate can cancel whatever the thread is parked on.
pub(crate) trait AbortableWait: Send + Sync {
    fn abort_wait(&self) -> bool;
    fn terminate_wait(&self) -> bool;
}

impl<P: Send> AbortableWait for ParkCell<P> {
    fn abort_wait(&self) -> bool {
        self.wake(WakeStatus::Aborted, None)
    }

    fn terminate_wait(&self) -> bool {
        self.wake(WakeStatus::Terminated, None)
    }
}
