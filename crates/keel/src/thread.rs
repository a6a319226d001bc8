//! Threads.
//!
//! A [`Thread`] pairs a registered control block with a host thread that
//! animates it. The host thread spawns parked at a start gate; the first
//! `resume()` releases it. Suspension and termination are cooperative: the
//! observable state flips immediately, the host thread honors it at its
//! next kernel boundary (object wait, sleep, relinquish, entry return).
//! After termination every kernel service refuses the residual execution
//! with `Terminated`.
//!
//! The entry closure and its argument are erased at construction, so
//! `reset()` can run the same `(entry, argument)` pair again on a fresh
//! host thread.
//!
//! Join is emulated: the kernel has no native join, so `join()` installs an
//! exit notification that releases a binary semaphore and parks on it. The
//! notification slot is single, shared with [`Thread::entry_exit_notify`],
//! which is what makes the single-joiner rule checkable.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};
pub use crate::kernel::threads::ThreadEvent;
use crate::kernel::threads::{self, Phase, ThreadCb, ThreadHook};
use crate::kernel::{Kernel, KernelObject, ObjectId, ObjectKind, MAX_PRIORITY};
use crate::logging::{default_sink, ObjectLog, SharedSink};
use crate::semaphore::Semaphore;
use crate::wait::WaitOption;

const LOG_TARGET: &str = "keel::thread";

/// Default host stack-size hint.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Distinguishes concurrent join rendezvous registrations.
static JOIN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Urgency of a thread, `0..=63`, larger is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadPriority(pub u8);

impl ThreadPriority {
    pub const MAX: Self = Self(MAX_PRIORITY);
}

impl Default for ThreadPriority {
    fn default() -> Self {
        Self(16)
    }
}

/// Construction parameters; the name doubles as the registry key.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    pub name: String,
    pub priority: ThreadPriority,
    pub stack_size: usize,
}

impl ThreadConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: ThreadPriority::default(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn with_priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }
}

/// Externally observable lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Suspended,
    Terminated,
    Completed,
}

struct ThreadShared {
    kernel: Arc<Kernel>,
    log: ObjectLog,
    config: ThreadConfig,
    entry: Arc<dyn Fn() + Send + Sync>,
    cb: RwLock<Option<Arc<ThreadCb>>>,
    host: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ThreadShared {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.get_mut().take() {
            self.log.debug(format_args!("del() on drop"));
            let (_, hook) = cb.terminate();
            if let Some(hook) = hook {
                hook(ThreadEvent::Exit);
            }
            if let Some(handle) = self.host.get_mut().take() {
                if handle.is_finished() {
                    let _ = handle.join();
                }
            }
            self.kernel
                .unregister(ObjectKind::Thread, self.log.name(), cb.id());
        }
    }
}

/// Named thread handle. Clones share the same thread.
#[derive(Clone)]
pub struct Thread {
    shared: Arc<ThreadShared>,
}

impl Thread {
    pub fn new(
        kernel: &Arc<Kernel>,
        config: ThreadConfig,
        entry: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::with_sink(kernel, config, default_sink(), entry)
    }

    /// Entry taking an argument; the `(entry, argument)` pair is erased
    /// here so [`reset`](Self::reset) can run it again.
    pub fn with_arg<A>(
        kernel: &Arc<Kernel>,
        config: ThreadConfig,
        entry: impl Fn(A) + Send + Sync + 'static,
        arg: A,
    ) -> Self
    where
        A: Clone + Send + Sync + 'static,
    {
        Self::new(kernel, config, move || entry(arg.clone()))
    }

    pub fn with_sink(
        kernel: &Arc<Kernel>,
        config: ThreadConfig,
        sink: SharedSink,
        entry: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(ThreadShared {
                kernel: Arc::clone(kernel),
                log: ObjectLog::new("Thread", LOG_TARGET, config.name.clone(), sink),
                config,
                entry: Arc::new(entry),
                cb: RwLock::new(None),
                host: Mutex::new(None),
            }),
        }
    }

    /// Registers the thread and spawns its host thread parked at the start
    /// gate; nothing runs until [`resume`](Self::resume). An earlier run
    /// must have fully wound down before recreation (reported at INFO).
    pub fn create_thread(&self) -> KernelResult<()> {
        if self.shared.config.priority.0 > MAX_PRIORITY {
            let err = KernelError::InvalidParameter;
            self.shared.log.error_status("thread_create", err);
            return Err(err);
        }
        let mut slot = self.shared.cb.write();
        if let Some(old) = slot.as_ref() {
            let old = Arc::clone(old);
            if !old.is_finished() || !self.reap_host(&old) {
                drop(slot);
                let err = KernelError::InvalidState;
                self.shared.log.error_status("thread_create", err);
                return Err(err);
            }
            self.shared
                .log
                .info(format_args!("create_thread() recreating"));
            self.shared
                .kernel
                .unregister(ObjectKind::Thread, self.shared.log.name(), old.id());
            *slot = None;
        }
        let id = match self
            .shared
            .kernel
            .register(ObjectKind::Thread, self.shared.log.name())
        {
            Ok(id) => id,
            Err(err) => {
                drop(slot);
                self.shared.log.error_status("thread_create", err);
                return Err(err);
            }
        };
        let cb = ThreadCb::new(
            id,
            self.shared.config.name.clone(),
            self.shared.config.priority.0,
        );
        let handle = match self.spawn_host(Arc::clone(&cb)) {
            Ok(handle) => handle,
            Err(_) => {
                self.shared
                    .kernel
                    .unregister(ObjectKind::Thread, self.shared.log.name(), id);
                drop(slot);
                let err = KernelError::NoMemory;
                self.shared.log.error_status("thread_create", err);
                return Err(err);
            }
        };
        *slot = Some(cb);
        *self.shared.host.lock() = Some(handle);
        drop(slot);
        self.shared.log.debug(format_args!(
            "create_thread(priority = {}, stack_size = {})",
            self.shared.config.priority.0, self.shared.config.stack_size
        ));
        Ok(())
    }

    pub fn create_and_resume(&self) -> KernelResult<()> {
        self.create_thread()?;
        self.resume()
    }

    fn spawn_host(&self, cb: Arc<ThreadCb>) -> std::io::Result<JoinHandle<()>> {
        let entry = Arc::clone(&self.shared.entry);
        let log = self.shared.log.clone();
        std::thread::Builder::new()
            .name(self.shared.config.name.clone())
            .stack_size(self.shared.config.stack_size)
            .spawn(move || {
                threads::set_current(Arc::clone(&cb));
                if cb.wait_for_start().is_ok() {
                    if let Some(hook) = cb.entry_hook() {
                        hook(ThreadEvent::Entry);
                    }
                    let panicked = catch_unwind(AssertUnwindSafe(|| entry())).is_err();
                    if panicked {
                        log.error(format_args!("entry panicked"));
                    }
                    if let Some(hook) = cb.complete(panicked) {
                        hook(ThreadEvent::Exit);
                    }
                }
                threads::clear_current();
            })
    }

    /// Reaps the previous host thread. A completed entry is past its last
    /// kernel boundary, so joining its host is bounded. A terminated entry
    /// may still be executing residually; then the caller must refuse.
    fn reap_host(&self, cb: &ThreadCb) -> bool {
        let handle = self.shared.host.lock().take();
        if let Some(handle) = handle {
            if cb.phase() == Phase::Completed || handle.is_finished() {
                let _ = handle.join();
            } else {
                *self.shared.host.lock() = Some(handle);
                return false;
            }
        }
        true
    }

    fn cb(&self, op: &'static str) -> KernelResult<Arc<ThreadCb>> {
        match self.shared.cb.read().as_ref() {
            Some(cb) => Ok(Arc::clone(cb)),
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status(op, err);
                Err(err)
            }
        }
    }

    /// Releases the start gate or lifts a suspension. Resuming a runnable
    /// or blocked thread is a no-op; a finished thread refuses.
    pub fn resume(&self) -> KernelResult<()> {
        let cb = self.cb("thread_resume")?;
        self.shared.log.debug(format_args!("resume()"));
        match cb.resume() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.log.error_status("thread_resume", err);
                Err(err)
            }
        }
    }

    /// Requests suspension; the target honors it at its next kernel
    /// boundary. Self-suspension parks right here.
    pub fn suspend(&self) -> KernelResult<()> {
        let cb = self.cb("thread_suspend")?;
        self.shared.log.debug(format_args!("suspend()"));
        if let Err(err) = cb.suspend() {
            self.shared.log.error_status("thread_suspend", err);
            return Err(err);
        }
        if self.is_current() {
            return cb.checkpoint();
        }
        Ok(())
    }

    /// One-way exit from any non-completed state. Aborts an in-flight
    /// wait and fires the exit notification exactly once. Terminating an
    /// already finished thread is a no-op.
    pub fn terminate(&self) -> KernelResult<()> {
        let cb = self.cb("thread_terminate")?;
        self.shared.log.debug(format_args!("terminate()"));
        let (_, hook) = cb.terminate();
        if let Some(hook) = hook {
            hook(ThreadEvent::Exit);
        }
        Ok(())
    }

    /// Re-arms a finished thread: same entry and argument, state back to
    /// Created, fresh host thread parked at the start gate. Refused while
    /// the previous host thread is still winding down.
    pub fn reset(&self) -> KernelResult<()> {
        let cb = self.cb("thread_reset")?;
        self.shared.log.debug(format_args!("reset()"));
        if !cb.is_finished() || !self.reap_host(&cb) {
            let err = KernelError::InvalidState;
            self.shared.log.error_status("thread_reset", err);
            return Err(err);
        }
        if let Err(err) = cb.reset() {
            self.shared.log.error_status("thread_reset", err);
            return Err(err);
        }
        let handle = match self.spawn_host(Arc::clone(&cb)) {
            Ok(handle) => handle,
            Err(_) => {
                let err = KernelError::NoMemory;
                self.shared.log.error_status("thread_reset", err);
                return Err(err);
            }
        };
        *self.shared.host.lock() = Some(handle);
        Ok(())
    }

    /// Blocks until the thread completes or is terminated.
    ///
    /// Emulated rendezvous: installs an exit notification releasing a
    /// binary semaphore and parks on it. Joining yourself is refused with
    /// `DeadlockAvoided`; a finished thread, a pending join, or an
    /// installed user notification refuse with `NotJoinable`.
    pub fn join(&self) -> KernelResult<()> {
        let cb = self.cb("thread_join")?;
        self.shared.log.debug(format_args!("join()"));
        if let Some(current) = threads::current_cb() {
            if Arc::ptr_eq(&current, &cb) {
                let err = KernelError::DeadlockAvoided;
                self.shared.log.error_status("thread_join", err);
                return Err(err);
            }
        }
        let nonce = JOIN_SEQ.fetch_add(1, Ordering::Relaxed);
        let rendezvous = Semaphore::with_sink(
            &self.shared.kernel,
            format!("{}.join.{nonce}", self.shared.config.name),
            self.shared.log.sink(),
        );
        rendezvous.create(0)?;
        let signal = rendezvous.clone();
        let hook: ThreadHook = Arc::new(move |event| {
            // Binary by construction: a second release cannot overshoot.
            if event == ThreadEvent::Exit {
                let _ = signal.ceiling_put(1);
            }
        });
        if let Err(err) = cb.install_join_hook(hook) {
            let _ = rendezvous.del();
            self.shared.log.error_status("thread_join", err);
            return Err(err);
        }
        let outcome = rendezvous.get(WaitOption::Forever);
        let _ = rendezvous.del();
        outcome
    }

    /// Whether a join could be started right now.
    pub fn joinable(&self) -> bool {
        self.shared
            .cb
            .read()
            .as_ref()
            .map(|cb| cb.joinable())
            .unwrap_or(false)
    }

    /// Wakes the target's in-flight wait with `WaitAborted`. Fails with
    /// `NotWaiting` when the target is not blocked.
    pub fn wait_abort(&self) -> KernelResult<()> {
        let cb = self.cb("thread_wait_abort")?;
        self.shared.log.debug(format_args!("wait_abort()"));
        match cb.abort_wait() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.log.error_status("thread_wait_abort", err);
                Err(err)
            }
        }
    }

    /// Registers the entry/exit notification. The slot is single and
    /// shared with join, so an installed hook makes the thread
    /// non-joinable.
    pub fn entry_exit_notify(
        &self,
        hook: impl Fn(ThreadEvent) + Send + Sync + 'static,
    ) -> KernelResult<()> {
        let cb = self.cb("thread_entry_exit_notify")?;
        self.shared.log.debug(format_args!("entry_exit_notify(..)"));
        match cb.install_notify(Arc::new(hook)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.log.error_status("thread_entry_exit_notify", err);
                Err(err)
            }
        }
    }

    pub fn state(&self) -> KernelResult<ThreadState> {
        let cb = self.cb("thread_state")?;
        let current = threads::current_cb()
            .map(|c| Arc::ptr_eq(&c, &cb))
            .unwrap_or(false);
        Ok(match cb.phase() {
            Phase::Created => ThreadState::Created,
            Phase::Runnable => {
                if current {
                    ThreadState::Running
                } else {
                    ThreadState::Ready
                }
            }
            Phase::Blocked | Phase::Suspended => ThreadState::Suspended,
            Phase::Completed => ThreadState::Completed,
            Phase::Terminated => ThreadState::Terminated,
        })
    }

    pub fn priority(&self) -> KernelResult<ThreadPriority> {
        let cb = self.cb("thread_priority")?;
        Ok(ThreadPriority(cb.priority()))
    }

    /// Changes the live priority, returning the previous one. A suspended
    /// waiter is re-ranked immediately on its suspension list.
    pub fn set_priority(&self, priority: ThreadPriority) -> KernelResult<ThreadPriority> {
        let cb = self.cb("thread_set_priority")?;
        if priority.0 > MAX_PRIORITY {
            let err = KernelError::InvalidParameter;
            self.shared.log.error_status("thread_set_priority", err);
            return Err(err);
        }
        self.shared
            .log
            .debug(format_args!("set_priority({})", priority.0));
        Ok(ThreadPriority(cb.set_priority(priority.0)))
    }

    pub fn is_current(&self) -> bool {
        match (threads::current_cb(), self.shared.cb.read().as_ref()) {
            (Some(current), Some(cb)) => Arc::ptr_eq(&current, cb),
            _ => false,
        }
    }
}

impl KernelObject for Thread {
    fn name(&self) -> &str {
        self.shared.log.name()
    }

    fn id(&self) -> Option<ObjectId> {
        self.shared.cb.read().as_ref().map(|cb| cb.id())
    }

    /// Terminates first when needed, then deregisters. The host thread of
    /// a cooperatively terminated entry reaps itself at its next boundary.
    fn del(&self) -> KernelResult<()> {
        let taken = self.shared.cb.write().take();
        match taken {
            Some(cb) => {
                self.shared.log.debug(format_args!("del()"));
                let (_, hook) = cb.terminate();
                if let Some(hook) = hook {
                    hook(ThreadEvent::Exit);
                }
                if let Some(handle) = self.shared.host.lock().take() {
                    if handle.is_finished() {
                        let _ = handle.join();
                    }
                }
                self.shared
                    .kernel
                    .unregister(ObjectKind::Thread, self.shared.log.name(), cb.id());
                Ok(())
            }
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status("thread_del", err);
                Err(err)
            }
        }
    }
}
