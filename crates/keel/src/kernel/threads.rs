//! Thread control blocks.
//!
//! A control block outlives the host thread that animates it: handles keep
//! it for state queries after completion, and `reset()` reuses it for a
//! fresh run. All lifecycle decisions happen under the `life` mutex; the
//! `gate` condvar parks the host thread while it is suspended or not yet
//! resumed. Suspension and termination are cooperative: a request marks the
//! control block immediately, and the host thread honors it at the next
//! kernel boundary (object wait, sleep, relinquish, or entry return).
//!
//! Lock order is object control block, then `life`, then a waiter's park
//! cell. `terminate()` claims the victim's park cell while holding `life`;
//! nothing takes `life` while holding a cell.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{KernelError, KernelResult};

use super::park::AbortableWait;
use super::ObjectId;

/// Delivered to an entry/exit notification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEvent {
    /// The thread is about to run its entry function.
    Entry,
    /// The entry function returned, or the thread was terminated.
    Exit,
}

pub(crate) type ThreadHook = Arc<dyn Fn(ThreadEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Runnable,
    Blocked,
    Suspended,
    Completed,
    Terminated,
}

struct Life {
    phase: Phase,
    priority: u8,
    original_priority: u8,
    suspend_pending: bool,
    current_wait: Option<Arc<dyn AbortableWait>>,
    notify: Option<ThreadHook>,
}

pub(crate) struct ThreadCb {
    id: ObjectId,
    name: String,
    life: Mutex<Life>,
    gate: Condvar,
}

impl ThreadCb {
    pub(crate) fn new(id: ObjectId, name: String, priority: u8) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            life: Mutex::new(Life {
                phase: Phase::Created,
                priority,
                original_priority: priority,
                suspend_pending: false,
                current_wait: None,
                notify: None,
            }),
            gate: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn phase(&self) -> Phase {
        self.life.lock().phase
    }

    pub(crate) fn priority(&self) -> u8 {
        self.life.lock().priority
    }

    /// Returns the previous priority.
    pub(crate) fn set_priority(&self, priority: u8) -> u8 {
        let mut life = self.life.lock();
        std::mem::replace(&mut life.priority, priority)
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.phase(), Phase::Completed | Phase::Terminated)
    }

    /// Makes the thread runnable and cancels any pending suspension.
    pub(crate) fn resume(&self) -> KernelResult<()> {
        let mut life = self.life.lock();
        life.suspend_pending = false;
        match life.phase {
            Phase::Created | Phase::Suspended => {
                life.phase = Phase::Runnable;
                self.gate.notify_all();
                Ok(())
            }
            Phase::Runnable | Phase::Blocked => Ok(()),
            Phase::Completed | Phase::Terminated => Err(KernelError::InvalidState),
        }
    }

    /// Requests suspension. A running or blocked thread keeps going until
    /// its next kernel boundary.
    pub(crate) fn suspend(&self) -> KernelResult<()> {
        let mut life = self.life.lock();
        match life.phase {
            Phase::Completed | Phase::Terminated => Err(KernelError::InvalidState),
            Phase::Created | Phase::Suspended => Ok(()),
            Phase::Runnable | Phase::Blocked => {
                life.suspend_pending = true;
                Ok(())
            }
        }
    }

    /// Parks the host thread until the first `resume()`. Entry point of the
    /// trampoline; `Err` means the thread was terminated before it ran.
    pub(crate) fn wait_for_start(&self) -> KernelResult<()> {
        let mut life = self.life.lock();
        loop {
            match life.phase {
                Phase::Created | Phase::Suspended | Phase::Blocked => {
                    self.gate.wait(&mut life);
                }
                Phase::Runnable => {
                    if life.suspend_pending {
                        life.suspend_pending = false;
                        life.phase = Phase::Suspended;
                        continue;
                    }
                    return Ok(());
                }
                Phase::Completed | Phase::Terminated => {
                    return Err(KernelError::Terminated);
                }
            }
        }
    }

    /// A kernel boundary: honors pending suspension and termination.
    pub(crate) fn checkpoint(&self) -> KernelResult<()> {
        let mut life = self.life.lock();
        loop {
            match life.phase {
                Phase::Terminated => return Err(KernelError::Terminated),
                Phase::Suspended => self.gate.wait(&mut life),
                Phase::Runnable => {
                    if life.suspend_pending {
                        life.suspend_pending = false;
                        life.phase = Phase::Suspended;
                        continue;
                    }
                    return Ok(());
                }
                Phase::Created | Phase::Blocked | Phase::Completed => return Ok(()),
            }
        }
    }

    /// Records the wait the thread is about to park on. `false` means the
    /// thread is already terminated and must not park.
    pub(crate) fn begin_wait(&self, wait: Arc<dyn AbortableWait>) -> bool {
        let mut life = self.life.lock();
        if matches!(life.phase, Phase::Terminated) {
            return false;
        }
        life.phase = Phase::Blocked;
        life.current_wait = Some(wait);
        true
    }

    /// Leaves the blocked state, then honors any suspension or termination
    /// that arrived during the wait.
    pub(crate) fn finish_wait(&self) -> KernelResult<()> {
        let mut life = self.life.lock();
        life.current_wait = None;
        if matches!(life.phase, Phase::Blocked) {
            life.phase = Phase::Runnable;
        }
        loop {
            match life.phase {
                Phase::Terminated => return Err(KernelError::Terminated),
                Phase::Suspended => self.gate.wait(&mut life),
                Phase::Runnable => {
                    if life.suspend_pending {
                        life.suspend_pending = false;
                        life.phase = Phase::Suspended;
                        continue;
                    }
                    return Ok(());
                }
                Phase::Created | Phase::Blocked | Phase::Completed => return Ok(()),
            }
        }
    }

    /// Claims the current wait, if any, out from under the thread.
    pub(crate) fn abort_wait(&self) -> KernelResult<()> {
        let wait = self.life.lock().current_wait.take();
        match wait {
            Some(w) if w.abort_wait() => Ok(()),
            _ => Err(KernelError::NotWaiting),
        }
    }

    /// Marks the thread terminated and claims any wait it is parked on.
    /// Returns whether the transition happened and the notification hook the
    /// caller must fire (outside all locks).
    pub(crate) fn terminate(&self) -> (bool, Option<ThreadHook>) {
        let mut life = self.life.lock();
        if matches!(life.phase, Phase::Completed | Phase::Terminated) {
            return (false, None);
        }
        life.phase = Phase::Terminated;
        life.suspend_pending = false;
        if let Some(wait) = life.current_wait.take() {
            wait.terminate_wait();
        }
        let hook = life.notify.take();
        self.gate.notify_all();
        (true, hook)
    }

    /// Entry function returned (or panicked). Returns the notification hook
    /// to fire, or `None` when a terminate already claimed the exit.
    pub(crate) fn complete(&self, panicked: bool) -> Option<ThreadHook> {
        let mut life = self.life.lock();
        if matches!(life.phase, Phase::Terminated) {
            return None;
        }
        life.phase = if panicked {
            Phase::Terminated
        } else {
            Phase::Completed
        };
        life.current_wait = None;
        self.gate.notify_all();
        life.notify.take()
    }

    /// Hook to fire for `ThreadEvent::Entry`; stays installed.
    pub(crate) fn entry_hook(&self) -> Option<ThreadHook> {
        self.life.lock().notify.clone()
    }

    /// The notification slot is single. Join claims it; a thread with a
    /// user callback installed, or one already finished, is not joinable.
    pub(crate) fn install_join_hook(&self, hook: ThreadHook) -> KernelResult<()> {
        let mut life = self.life.lock();
        if matches!(life.phase, Phase::Completed | Phase::Terminated) || life.notify.is_some() {
            return Err(KernelError::NotJoinable);
        }
        life.notify = Some(hook);
        Ok(())
    }

    pub(crate) fn install_notify(&self, hook: ThreadHook) -> KernelResult<()> {
        let mut life = self.life.lock();
        if matches!(life.phase, Phase::Completed | Phase::Terminated) || life.notify.is_some() {
            return Err(KernelError::InvalidState);
        }
        life.notify = Some(hook);
        Ok(())
    }

    pub(crate) fn joinable(&self) -> bool {
        let life = self.life.lock();
        !matches!(life.phase, Phase::Completed | Phase::Terminated) && life.notify.is_none()
    }

    /// Rewinds a finished control block to its created state.
    pub(crate) fn reset(&self) -> KernelResult<()> {
        let mut life = self.life.lock();
        if !matches!(life.phase, Phase::Completed | Phase::Terminated) {
            return Err(KernelError::InvalidState);
        }
        life.phase = Phase::Created;
        life.suspend_pending = false;
        life.current_wait = None;
        life.notify = None;
        life.priority = life.original_priority;
        Ok(())
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadCb>>> = RefCell::new(None);
}

pub(crate) fn set_current(cb: Arc<ThreadCb>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(cb));
}

pub(crate) fn clear_current() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Control block of the calling thread, if it is a kernel thread.
pub(crate) fn current_cb() -> Option<Arc<ThreadCb>> {
    CURRENT.with(|c| c.borrow().clone())
}
