//! Fixed-message queues.
//!
//! A [`Queue`] carries fixed-size byte messages through a circular buffer
//! carved from caller-supplied storage; the queue itself never allocates
//! the message area. Payloads are copied by value in both directions.
//!
//! Blocking protocol: receivers park only on an empty queue, senders only
//! on a full one. A send that finds a parked receiver hands the payload off
//! directly through the waiter's cell. A receive that frees a slot (and a
//! flush that empties the ring) admits parked senders into the storage and
//! wakes them with success, so a woken sender's message is already placed.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};
use crate::kernel::park::{ParkCell, WakeStatus};
use crate::kernel::waitlist::{Suspended, WaitList, WaiterCore};
use crate::kernel::{block_on_cell, threads, Kernel, KernelObject, ObjectId, ObjectKind};
use crate::logging::{default_sink, ObjectLog, SharedSink};
use crate::wait::WaitOption;

const LOG_TARGET: &str = "keel::queue";

type SendHook = Arc<dyn Fn() + Send + Sync>;

struct SendWaiter {
    core: WaiterCore,
    pending: Mutex<Option<Vec<u8>>>,
    to_front: bool,
    cell: Arc<ParkCell<()>>,
}

impl Suspended for SendWaiter {
    fn core(&self) -> &WaiterCore {
        &self.core
    }

    fn is_waiting(&self) -> bool {
        self.cell.is_waiting()
    }
}

struct RecvWaiter {
    core: WaiterCore,
    cell: Arc<ParkCell<Vec<u8>>>,
}

impl Suspended for RecvWaiter {
    fn core(&self) -> &WaiterCore {
        &self.core
    }

    fn is_waiting(&self) -> bool {
        self.cell.is_waiting()
    }
}

/// Cumulative counters reported by [`Queue::performance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePerf {
    pub sent: u64,
    pub received: u64,
    pub empty_suspensions: u64,
    pub full_suspensions: u64,
    pub timeouts: u64,
}

/// Snapshot reported by [`Queue::info`].
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub enqueued: usize,
    pub available: usize,
    pub waiting_senders: usize,
    pub waiting_receivers: usize,
    pub first_waiter: Option<String>,
}

struct QueueState {
    message_size: usize,
    capacity: usize,
    storage: Vec<u8>,
    head: usize,
    tail: usize,
    enqueued: usize,
    senders: WaitList<SendWaiter>,
    receivers: WaitList<RecvWaiter>,
    hook: Option<SendHook>,
    perf: QueuePerf,
}

impl QueueState {
    fn slot(&self, index: usize) -> std::ops::Range<usize> {
        let start = index * self.message_size;
        start..start + self.message_size
    }

    fn push_back(&mut self, msg: &[u8]) {
        let slot = self.slot(self.tail);
        self.storage[slot].copy_from_slice(msg);
        self.tail = (self.tail + 1) % self.capacity;
        self.enqueued += 1;
    }

    fn push_front(&mut self, msg: &[u8]) {
        self.head = (self.head + self.capacity - 1) % self.capacity;
        let slot = self.slot(self.head);
        self.storage[slot].copy_from_slice(msg);
        self.enqueued += 1;
    }

    fn pop_front(&mut self, dest: &mut [u8]) {
        let slot = self.slot(self.head);
        dest[..self.message_size].copy_from_slice(&self.storage[slot]);
        self.head = (self.head + 1) % self.capacity;
        self.enqueued -= 1;
    }

    /// Moves one parked sender's message into the ring and wakes it.
    /// Returns whether a send was completed (the caller owes a hook call).
    fn admit_one_sender(&mut self) -> bool {
        while let Some(waiter) = self.senders.take_best() {
            if waiter.cell.wake(WakeStatus::Granted, Some(())) {
                if let Some(msg) = waiter.pending.lock().take() {
                    if waiter.to_front {
                        self.push_front(&msg);
                    } else {
                        self.push_back(&msg);
                    }
                }
                self.perf.sent += 1;
                return true;
            }
        }
        false
    }
}

struct QueueCb {
    id: ObjectId,
    state: Mutex<QueueState>,
}

struct Shared {
    kernel: Arc<Kernel>,
    log: ObjectLog,
    cb: RwLock<Option<Arc<QueueCb>>>,
}

impl Shared {
    fn teardown(&self, cb: &Arc<QueueCb>) {
        let (senders, receivers) = {
            let mut state = cb.state.lock();
            state.head = 0;
            state.tail = 0;
            state.enqueued = 0;
            (state.senders.drain(), state.receivers.drain())
        };
        for waiter in senders {
            waiter.cell.wake(WakeStatus::Deleted, None);
        }
        for waiter in receivers {
            waiter.cell.wake(WakeStatus::Deleted, None);
        }
        self.kernel
            .unregister(ObjectKind::Queue, self.log.name(), cb.id);
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

/// Named message-queue handle. Clones share the same object.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<Shared>,
}

impl Queue {
    pub fn new(kernel: &Arc<Kernel>, name: impl Into<String>) -> Self {
        Self::with_sink(kernel, name, default_sink())
    }

    pub fn with_sink(kernel: &Arc<Kernel>, name: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                kernel: Arc::clone(kernel),
                log: ObjectLog::new("Queue", LOG_TARGET, name.into(), sink),
                cb: RwLock::new(None),
            }),
        }
    }

    /// Registers the queue over `storage`, partitioned into
    /// `storage.len() / message_size` slots. Zero message size or zero
    /// capacity is refused. Creating an already created queue tears the old
    /// object down first and reports the recreation at INFO.
    pub fn create(&self, message_size: usize, storage: Vec<u8>) -> KernelResult<()> {
        let capacity = if message_size == 0 {
            0
        } else {
            storage.len() / message_size
        };
        if capacity == 0 {
            let err = KernelError::InvalidParameter;
            self.shared.log.error_status("queue_create", err);
            return Err(err);
        }
        let mut slot = self.shared.cb.write();
        if let Some(old) = slot.take() {
            self.shared.log.info(format_args!("create() recreating"));
            self.shared.teardown(&old);
        }
        let id = match self
            .shared
            .kernel
            .register(ObjectKind::Queue, self.shared.log.name())
        {
            Ok(id) => id,
            Err(err) => {
                self.shared.log.error_status("queue_create", err);
                return Err(err);
            }
        };
        *slot = Some(Arc::new(QueueCb {
            id,
            state: Mutex::new(QueueState {
                message_size,
                capacity,
                storage,
                head: 0,
                tail: 0,
                enqueued: 0,
                senders: WaitList::new(),
                receivers: WaitList::new(),
                hook: None,
                perf: QueuePerf::default(),
            }),
        }));
        self.shared.log.debug(format_args!(
            "create(message_size = {message_size}, capacity = {capacity})"
        ));
        Ok(())
    }

    fn cb(&self, op: &'static str) -> KernelResult<Arc<QueueCb>> {
        match self.shared.cb.read().as_ref() {
            Some(cb) => Ok(Arc::clone(cb)),
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status(op, err);
                Err(err)
            }
        }
    }

    /// Appends a message of exactly `message_size` bytes.
    pub fn send(&self, msg: &[u8], wait: WaitOption) -> KernelResult<()> {
        self.send_impl("queue_send", msg, wait, false)
    }

    /// Like [`send`](Self::send) but the message jumps to the head,
    /// received before everything already enqueued.
    pub fn front_send(&self, msg: &[u8], wait: WaitOption) -> KernelResult<()> {
        self.send_impl("queue_front_send", msg, wait, true)
    }

    fn send_impl(
        &self,
        op: &'static str,
        msg: &[u8],
        wait: WaitOption,
        to_front: bool,
    ) -> KernelResult<()> {
        let cb = self.cb(op)?;
        self.shared.log.debug(format_args!(
            "{}({} bytes, {wait})",
            if to_front { "front_send" } else { "send" },
            msg.len()
        ));
        let cell = {
            let mut state = cb.state.lock();
            if msg.len() != state.message_size {
                drop(state);
                let err = KernelError::InvalidParameter;
                self.shared.log.error_status(op, err);
                return Err(err);
            }
            // Receivers park only on an empty queue; hand off directly.
            if state.enqueued == 0 {
                while let Some(receiver) = state.receivers.take_best() {
                    if receiver
                        .cell
                        .wake(WakeStatus::Granted, Some(msg.to_vec()))
                    {
                        state.perf.sent += 1;
                        let hook = state.hook.clone();
                        drop(state);
                        if let Some(hook) = hook {
                            hook();
                        }
                        return Ok(());
                    }
                }
            }
            if state.enqueued < state.capacity {
                if to_front {
                    state.push_front(msg);
                } else {
                    state.push_back(msg);
                }
                state.perf.sent += 1;
                let hook = state.hook.clone();
                drop(state);
                if let Some(hook) = hook {
                    hook();
                }
                return Ok(());
            }
            if !wait.blocks() {
                return Err(KernelError::WouldBlock);
            }
            state.perf.full_suspensions += 1;
            let seq = state.senders.next_seq();
            let waiter = Arc::new(SendWaiter {
                core: WaiterCore::new(
                    seq,
                    threads::current_cb(),
                    self.shared.kernel.external_waiter_priority(),
                ),
                pending: Mutex::new(Some(msg.to_vec())),
                to_front,
                cell: ParkCell::new(),
            });
            state.senders.insert(Arc::clone(&waiter));
            waiter.cell.clone()
        };
        let (status, _) = block_on_cell(&cell, self.shared.kernel.deadline(wait));
        // An unserved sender husk would pin its pending message copy, so
        // the leaving waiter prunes; deletion already drained the list.
        match status {
            // The admitting side already placed the message, counted it,
            // and owes the hook call.
            WakeStatus::Granted => Ok(()),
            WakeStatus::TimedOut => {
                let mut state = cb.state.lock();
                state.perf.timeouts += 1;
                state.senders.prune();
                Err(KernelError::Timeout)
            }
            WakeStatus::Deleted => Err(KernelError::Deleted),
            WakeStatus::Aborted => {
                cb.state.lock().senders.prune();
                Err(KernelError::WaitAborted)
            }
            WakeStatus::Terminated => {
                cb.state.lock().senders.prune();
                Err(KernelError::Terminated)
            }
        }
    }

    /// Copies the oldest message into `dest`, which must hold at least
    /// `message_size` bytes. Freeing a slot admits one parked sender.
    pub fn receive(&self, dest: &mut [u8], wait: WaitOption) -> KernelResult<()> {
        let cb = self.cb("queue_receive")?;
        self.shared.log.debug(format_args!("receive({wait})"));
        let cell = {
            let mut state = cb.state.lock();
            if dest.len() < state.message_size {
                drop(state);
                let err = KernelError::InvalidParameter;
                self.shared.log.error_status("queue_receive", err);
                return Err(err);
            }
            if state.enqueued > 0 {
                state.pop_front(dest);
                state.perf.received += 1;
                let admitted = state.admit_one_sender();
                let hook = if admitted { state.hook.clone() } else { None };
                drop(state);
                if let Some(hook) = hook {
                    hook();
                }
                return Ok(());
            }
            if !wait.blocks() {
                return Err(KernelError::WouldBlock);
            }
            state.perf.empty_suspensions += 1;
            let seq = state.receivers.next_seq();
            let waiter = Arc::new(RecvWaiter {
                core: WaiterCore::new(
                    seq,
                    threads::current_cb(),
                    self.shared.kernel.external_waiter_priority(),
                ),
                cell: ParkCell::new(),
            });
            state.receivers.insert(Arc::clone(&waiter));
            waiter.cell.clone()
        };
        let (status, payload) = block_on_cell(&cell, self.shared.kernel.deadline(wait));
        match status {
            WakeStatus::Granted => {
                if let Some(msg) = payload {
                    dest[..msg.len()].copy_from_slice(&msg);
                }
                cb.state.lock().perf.received += 1;
                Ok(())
            }
            WakeStatus::TimedOut => {
                let mut state = cb.state.lock();
                state.perf.timeouts += 1;
                state.receivers.prune();
                Err(KernelError::Timeout)
            }
            WakeStatus::Deleted => Err(KernelError::Deleted),
            WakeStatus::Aborted => {
                cb.state.lock().receivers.prune();
                Err(KernelError::WaitAborted)
            }
            WakeStatus::Terminated => {
                cb.state.lock().receivers.prune();
                Err(KernelError::Terminated)
            }
        }
    }

    /// Drops every enqueued message, then admits parked senders into the
    /// emptied storage, each woken with success.
    pub fn flush(&self) -> KernelResult<()> {
        let cb = self.cb("queue_flush")?;
        self.shared.log.debug(format_args!("flush()"));
        let (admitted, hook) = {
            let mut state = cb.state.lock();
            state.head = 0;
            state.tail = 0;
            state.enqueued = 0;
            let mut admitted = 0u32;
            while state.enqueued < state.capacity && state.admit_one_sender() {
                admitted += 1;
            }
            (admitted, state.hook.clone())
        };
        if let Some(hook) = hook {
            for _ in 0..admitted {
                hook();
            }
        }
        Ok(())
    }

    /// Promotes the best waiter to the stored front. Only one side can hold
    /// waiters at a time, so both lists are treated.
    pub fn prioritize(&self) -> KernelResult<()> {
        let cb = self.cb("queue_prioritize")?;
        self.shared.log.debug(format_args!("prioritize()"));
        let mut state = cb.state.lock();
        state.senders.prioritize();
        state.receivers.prioritize();
        Ok(())
    }

    /// Installs the hook run after every successful send, including sends
    /// completed on behalf of a parked sender. Replaces any previous hook.
    pub fn send_notify(&self, hook: impl Fn() + Send + Sync + 'static) -> KernelResult<()> {
        let cb = self.cb("queue_send_notify")?;
        self.shared.log.debug(format_args!("send_notify(..)"));
        cb.state.lock().hook = Some(Arc::new(hook));
        Ok(())
    }

    pub fn is_empty(&self) -> KernelResult<bool> {
        let cb = self.cb("queue_is_empty")?;
        let empty = cb.state.lock().enqueued == 0;
        Ok(empty)
    }

    pub fn info(&self) -> KernelResult<QueueInfo> {
        let cb = self.cb("queue_info")?;
        let state = cb.state.lock();
        let first_waiter = state
            .receivers
            .first_waiting_name()
            .or_else(|| state.senders.first_waiting_name());
        Ok(QueueInfo {
            name: self.shared.log.name().to_string(),
            enqueued: state.enqueued,
            available: state.capacity - state.enqueued,
            waiting_senders: state.senders.waiting_count(),
            waiting_receivers: state.receivers.waiting_count(),
            first_waiter,
        })
    }

    pub fn performance(&self) -> KernelResult<QueuePerf> {
        let cb = self.cb("queue_performance")?;
        let perf = cb.state.lock().perf;
        Ok(perf)
    }
}

impl KernelObject for Queue {
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
                self.shared.log.error_status("queue_del", err);
                Err(err)
            }
        }
    }
}
