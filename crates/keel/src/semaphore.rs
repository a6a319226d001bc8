//! Counting semaphores.
//!
//! A [`Semaphore`] is a named handle over a kernel-registered count.
//! `get` takes an instance or suspends the caller; `put` hands an instance
//! to the best waiter or increments the count. Waiters are released by
//! live thread priority, FIFO among equals. Deleting the object releases
//! every waiter with [`KernelError::Deleted`].

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};
use crate::kernel::park::{ParkCell, WakeStatus};
use crate::kernel::waitlist::{Suspended, WaitList, WaiterCore};
use crate::kernel::{block_on_cell, threads, Kernel, KernelObject, ObjectId, ObjectKind};
use crate::logging::{default_sink, ObjectLog, SharedSink};
use crate::wait::WaitOption;

const LOG_TARGET: &str = "keel::semaphore";

type PutHook = Arc<dyn Fn() + Send + Sync>;

struct SemWaiter {
    core: WaiterCore,
    cell: Arc<ParkCell<()>>,
}

impl Suspended for SemWaiter {
    fn core(&self) -> &WaiterCore {
        &self.core
    }

    fn is_waiting(&self) -> bool {
        self.cell.is_waiting()
    }
}

/// Cumulative counters reported by [`Semaphore::performance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SemaphorePerf {
    pub puts: u64,
    pub gets: u64,
    pub suspensions: u64,
    pub timeouts: u64,
}

/// Snapshot reported by [`Semaphore::info`].
#[derive(Debug, Clone)]
pub struct SemaphoreInfo {
    pub name: String,
    pub count: u32,
    pub waiting: usize,
    pub first_waiter: Option<String>,
}

struct SemState {
    count: u32,
    waiters: WaitList<SemWaiter>,
    hook: Option<PutHook>,
    perf: SemaphorePerf,
}

struct SemCb {
    id: ObjectId,
    state: Mutex<SemState>,
}

struct Shared {
    kernel: Arc<Kernel>,
    log: ObjectLog,
    cb: RwLock<Option<Arc<SemCb>>>,
}

impl Shared {
    fn teardown(&self, cb: &Arc<SemCb>) {
        let drained = {
            let mut state = cb.state.lock();
            state.count = 0;
            state.waiters.drain()
        };
        for waiter in drained {
            waiter.cell.wake(WakeStatus::Deleted, None);
        }
        self.kernel
            .unregister(ObjectKind::Semaphore, self.log.name(), cb.id);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.get_mut().take() {
            self.log.debug(format_args!("del() on drop"));
            self.teardown(&cb);
        }
    }
}

/// Named counting semaphore handle. Clones share the same object.
#[derive(Clone)]
pub struct Semaphore {
    shared: Arc<Shared>,
}

impl Semaphore {
    /// Binds a handle to `name`. The kernel object itself is made by
    /// [`create`](Self::create).
    pub fn new(kernel: &Arc<Kernel>, name: impl Into<String>) -> Self {
        Self::with_sink(kernel, name, default_sink())
    }

    pub fn with_sink(kernel: &Arc<Kernel>, name: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                kernel: Arc::clone(kernel),
                log: ObjectLog::new("Semaphore", LOG_TARGET, name.into(), sink),
                cb: RwLock::new(None),
            }),
        }
    }

    /// Registers the object with an initial count. Creating an already
    /// created semaphore succeeds without touching it.
    pub fn create(&self, initial: u32) -> KernelResult<()> {
        let mut slot = self.shared.cb.write();
        if slot.is_some() {
            return Ok(());
        }
        let id = match self
            .shared
            .kernel
            .register(ObjectKind::Semaphore, self.shared.log.name())
        {
            Ok(id) => id,
            Err(err) => {
                self.shared.log.error_status("sem_create", err);
                return Err(err);
            }
        };
        *slot = Some(Arc::new(SemCb {
            id,
            state: Mutex::new(SemState {
                count: initial,
                waiters: WaitList::new(),
                hook: None,
                perf: SemaphorePerf::default(),
            }),
        }));
        self.shared
            .log
            .debug(format_args!("create(initial = {initial})"));
        Ok(())
    }

    fn cb(&self, op: &'static str) -> KernelResult<Arc<SemCb>> {
        match self.shared.cb.read().as_ref() {
            Some(cb) => Ok(Arc::clone(cb)),
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status(op, err);
                Err(err)
            }
        }
    }

    /// Takes one instance. With `NoWait` an unavailable instance reports
    /// `WouldBlock`; a timed wait reports `Timeout`; deletion, wait-abort,
    /// and termination pass through as their own kinds, none logged.
    pub fn get(&self, wait: WaitOption) -> KernelResult<()> {
        let cb = self.cb("sem_get")?;
        self.shared.log.debug(format_args!("get({wait})"));
        let cell = {
            let mut state = cb.state.lock();
            state.perf.gets += 1;
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            if !wait.blocks() {
                return Err(KernelError::WouldBlock);
            }
            state.perf.suspensions += 1;
            let seq = state.waiters.next_seq();
            let waiter = Arc::new(SemWaiter {
                core: WaiterCore::new(
                    seq,
                    threads::current_cb(),
                    self.shared.kernel.external_waiter_priority(),
                ),
                cell: ParkCell::new(),
            });
            state.waiters.insert(Arc::clone(&waiter));
            waiter.cell.clone()
        };
        let (status, _) = block_on_cell(&cell, self.shared.kernel.deadline(wait));
        // A waiter that leaves unserved removes its own husk; deletion
        // already drained the list.
        match status {
            WakeStatus::Granted => Ok(()),
            WakeStatus::TimedOut => {
                let mut state = cb.state.lock();
                state.perf.timeouts += 1;
                state.waiters.prune();
                Err(KernelError::Timeout)
            }
            WakeStatus::Deleted => Err(KernelError::Deleted),
            WakeStatus::Aborted => {
                cb.state.lock().waiters.prune();
                Err(KernelError::WaitAborted)
            }
            WakeStatus::Terminated => {
                cb.state.lock().waiters.prune();
                Err(KernelError::Terminated)
            }
        }
    }

    /// Releases one instance: the best waiter gets it directly, otherwise
    /// the count increments.
    pub fn put(&self) -> KernelResult<()> {
        self.shared.log.debug(format_args!("put()"));
        self.put_impl("sem_put", u32::MAX)
    }

    /// Like [`put`](Self::put) but refuses, count unchanged, when the count
    /// already sits at `ceiling`.
    pub fn ceiling_put(&self, ceiling: u32) -> KernelResult<()> {
        self.shared
            .log
            .debug(format_args!("ceiling_put({ceiling})"));
        if ceiling == 0 {
            let err = KernelError::InvalidParameter;
            self.shared.log.error_status("sem_ceiling_put", err);
            return Err(err);
        }
        self.put_impl("sem_ceiling_put", ceiling)
    }

    fn put_impl(&self, op: &'static str, ceiling: u32) -> KernelResult<()> {
        let cb = self.cb(op)?;
        let hook;
        {
            let mut state = cb.state.lock();
            state.perf.puts += 1;
            loop {
                if let Some(waiter) = state.waiters.take_best() {
                    // A claimed cell already lost its wake (timeout, abort);
                    // the instance goes to the next waiter instead.
                    if waiter.cell.wake(WakeStatus::Granted, Some(())) {
                        break;
                    }
                } else if state.count >= ceiling {
                    drop(state);
                    let err = KernelError::CeilingExceeded;
                    self.shared.log.error_status(op, err);
                    return Err(err);
                } else {
                    state.count += 1;
                    break;
                }
            }
            hook = state.hook.clone();
        }
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Moves the current best waiter to the front of the stored suspension
    /// list. Release order is unchanged; [`info`](Self::info) reports the
    /// promoted thread as the first waiter.
    pub fn prioritize(&self) -> KernelResult<()> {
        let cb = self.cb("sem_prioritize")?;
        self.shared.log.debug(format_args!("prioritize()"));
        cb.state.lock().waiters.prioritize();
        Ok(())
    }

    /// Installs the hook run after every successful `put`/`ceiling_put`,
    /// outside the object lock. Replaces any previous hook.
    pub fn put_notify(&self, hook: impl Fn() + Send + Sync + 'static) -> KernelResult<()> {
        let cb = self.cb("sem_put_notify")?;
        self.shared.log.debug(format_args!("put_notify(..)"));
        cb.state.lock().hook = Some(Arc::new(hook));
        Ok(())
    }

    pub fn count(&self) -> KernelResult<u32> {
        let cb = self.cb("sem_count")?;
        let count = cb.state.lock().count;
        Ok(count)
    }

    pub fn info(&self) -> KernelResult<SemaphoreInfo> {
        let cb = self.cb("sem_info")?;
        let state = cb.state.lock();
        Ok(SemaphoreInfo {
            name: self.shared.log.name().to_string(),
            count: state.count,
            waiting: state.waiters.waiting_count(),
            first_waiter: state.waiters.first_waiting_name(),
        })
    }

    pub fn performance(&self) -> KernelResult<SemaphorePerf> {
        let cb = self.cb("sem_performance")?;
        let perf = cb.state.lock().perf;
        Ok(perf)
    }
}

impl KernelObject for Semaphore {
    fn name(&self) -> &str {
        self.shared.log.name()
    }

    fn id(&self) -> Option<ObjectId> {
        self.shared.cb.read().as_ref().map(|cb| cb.id)
    }

    fn del(&self) -> KernelResult<()> {
        let taken = self.shared.cb.write().take();
        match taken {
            Some(cb) => {
                self.shared.log.debug(format_args!("del()"));
                self.shared.teardown(&cb);
                Ok(())
            }
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status("sem_del", err);
                Err(err)
            }
        }
    }
}
