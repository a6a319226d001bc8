//! 32-bit event-flag groups.
//!
//! `set` mutates the group (OR merges, AND masks) and releases every waiter
//! whose request became satisfiable, re-evaluating as `_CLEAR` grants
//! consume bits. `get` checks the request against the current group: AND
//! variants need all requested bits, OR variants at least one, and the
//! `_CLEAR` variants take the requested bits down atomically with
//! satisfaction. The value handed back is the group as observed at
//! satisfaction, before any clearing.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};
use crate::kernel::park::{ParkCell, WakeStatus};
use crate::kernel::waitlist::{Suspended, WaitList, WaiterCore};
use crate::kernel::{block_on_cell, threads, Kernel, KernelObject, ObjectId, ObjectKind};
use crate::logging::{default_sink, ObjectLog, SharedSink};
use crate::wait::WaitOption;

const LOG_TARGET: &str = "keel::event_flags";

type SetHook = Arc<dyn Fn() + Send + Sync>;

/// How a `get` request matches the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOption {
    /// All requested bits present.
    And,
    /// All requested bits present; clear them on satisfaction.
    AndClear,
    /// Any requested bit present.
    Or,
    /// Any requested bit present; clear the requested bits on satisfaction.
    OrClear,
}

impl GetOption {
    fn requires_all(self) -> bool {
        matches!(self, GetOption::And | GetOption::AndClear)
    }

    fn clears(self) -> bool {
        matches!(self, GetOption::AndClear | GetOption::OrClear)
    }
}

impl fmt::Display for GetOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GetOption::And => "And",
            GetOption::AndClear => "AndClear",
            GetOption::Or => "Or",
            GetOption::OrClear => "OrClear",
        })
    }
}

/// How a `set` mutates the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOption {
    /// `current |= flags`
    Or,
    /// `current &= flags`
    And,
}

impl fmt::Display for SetOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetOption::Or => "Or",
            SetOption::And => "And",
        })
    }
}

fn satisfied(current: u32, requested: u32, option: GetOption) -> bool {
    if option.requires_all() {
        (current & requested) == requested
    } else {
        (current & requested) != 0
    }
}

struct FlagsWaiter {
    core: WaiterCore,
    requested: u32,
    option: GetOption,
    cell: Arc<ParkCell<u32>>,
}

impl Suspended for FlagsWaiter {
    fn core(&self) -> &WaiterCore {
        &self.core
    }

    fn is_waiting(&self) -> bool {
        self.cell.is_waiting()
    }
}

/// Cumulative counters reported by [`EventFlags::performance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagsPerf {
    pub sets: u64,
    pub gets: u64,
    pub suspensions: u64,
    pub timeouts: u64,
}

/// Snapshot reported by [`EventFlags::info`].
#[derive(Debug, Clone)]
pub struct EventFlagsInfo {
    pub name: String,
    pub current: u32,
    pub waiting: usize,
    pub first_waiter: Option<String>,
}

struct FlagsState {
    current: u32,
    waiters: WaitList<FlagsWaiter>,
    hook: Option<SetHook>,
    perf: FlagsPerf,
}

struct FlagsCb {
    id: ObjectId,
    state: Mutex<FlagsState>,
}

struct Shared {
    kernel: Arc<Kernel>,
    log: ObjectLog,
    cb: RwLock<Option<Arc<FlagsCb>>>,
}

impl Shared {
    fn teardown(&self, cb: &Arc<FlagsCb>) {
        let drained = {
            let mut state = cb.state.lock();
            state.current = 0;
            state.waiters.drain()
        };
        for waiter in drained {
            waiter.cell.wake(WakeStatus::Deleted, None);
        }
        self.kernel
            .unregister(ObjectKind::EventFlags, self.log.name(), cb.id);
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

/// Named event-flag group handle. Clones share the same object.
#[derive(Clone)]
pub struct EventFlags {
    shared: Arc<Shared>,
}

impl EventFlags {
    pub fn new(kernel: &Arc<Kernel>, name: impl Into<String>) -> Self {
        Self::with_sink(kernel, name, default_sink())
    }

    pub fn with_sink(kernel: &Arc<Kernel>, name: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                kernel: Arc::clone(kernel),
                log: ObjectLog::new("EventFlags", LOG_TARGET, name.into(), sink),
                cb: RwLock::new(None),
            }),
        }
    }

    /// Registers the group; all flags start clear. Creating an already
    /// created group succeeds without touching it.
    pub fn create(&self) -> KernelResult<()> {
        let mut slot = self.shared.cb.write();
        if slot.is_some() {
            return Ok(());
        }
        let id = match self
            .shared
            .kernel
            .register(ObjectKind::EventFlags, self.shared.log.name())
        {
            Ok(id) => id,
            Err(err) => {
                self.shared.log.error_status("flags_create", err);
                return Err(err);
            }
        };
        *slot = Some(Arc::new(FlagsCb {
            id,
            state: Mutex::new(FlagsState {
                current: 0,
                waiters: WaitList::new(),
                hook: None,
                perf: FlagsPerf::default(),
            }),
        }));
        self.shared.log.debug(format_args!("create()"));
        Ok(())
    }

    fn cb(&self, op: &'static str) -> KernelResult<Arc<FlagsCb>> {
        match self.shared.cb.read().as_ref() {
            Some(cb) => Ok(Arc::clone(cb)),
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status(op, err);
                Err(err)
            }
        }
    }

    /// Waits for the requested bits and returns the group as observed at
    /// satisfaction. Unmet with `NoWait` reports `NoEvents`, never logged.
    pub fn get(&self, requested: u32, option: GetOption, wait: WaitOption) -> KernelResult<u32> {
        let cb = self.cb("flags_get")?;
        self.shared
            .log
            .debug(format_args!("get({requested:#010x}, {option}, {wait})"));
        let cell = {
            let mut state = cb.state.lock();
            state.perf.gets += 1;
            if satisfied(state.current, requested, option) {
                let actual = state.current;
                if option.clears() {
                    state.current &= !requested;
                }
                return Ok(actual);
            }
            if !wait.blocks() {
                return Err(KernelError::NoEvents);
            }
            state.perf.suspensions += 1;
            let seq = state.waiters.next_seq();
            let waiter = Arc::new(FlagsWaiter {
                core: WaiterCore::new(
                    seq,
                    threads::current_cb(),
                    self.shared.kernel.external_waiter_priority(),
                ),
                requested,
                option,
                cell: ParkCell::new(),
            });
            state.waiters.insert(Arc::clone(&waiter));
            waiter.cell.clone()
        };
        let (status, actual) = block_on_cell(&cell, self.shared.kernel.deadline(wait));
        // A waiter that leaves unserved removes its own husk; deletion
        // already drained the list.
        match status {
            WakeStatus::Granted => Ok(actual.unwrap_or(0)),
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

    /// Mutates the group and releases every waiter whose request the new
    /// value satisfies, highest priority first, `_CLEAR` consumption
    /// applied between releases. The set hook fires on every successful
    /// call, waiters or not.
    pub fn set(&self, flags: u32, option: SetOption) -> KernelResult<()> {
        let cb = self.cb("flags_set")?;
        self.shared
            .log
            .debug(format_args!("set({flags:#010x}, {option})"));
        let hook;
        {
            let mut state = cb.state.lock();
            state.perf.sets += 1;
            let mut current = match option {
                SetOption::Or => state.current | flags,
                SetOption::And => state.current & flags,
            };
            while let Some(waiter) = state
                .waiters
                .take_best_where(|w| satisfied(current, w.requested, w.option))
            {
                // Clear only for a wake that landed; a claimed cell must
                // not consume bits nobody receives.
                if waiter.cell.wake(WakeStatus::Granted, Some(current)) && waiter.option.clears() {
                    current &= !waiter.requested;
                }
            }
            state.current = current;
            hook = state.hook.clone();
        }
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Whether every bit of `mask` is set: `(flags & mask) == mask`.
    pub fn is_set(&self, mask: u32) -> KernelResult<bool> {
        let cb = self.cb("flags_is_set")?;
        let current = cb.state.lock().current;
        Ok((current & mask) == mask)
    }

    /// Blocks until all of `mask` is set.
    pub fn wait_all(&self, mask: u32) -> KernelResult<u32> {
        self.get(mask, GetOption::And, WaitOption::Forever)
    }

    /// Blocks until all of `mask` is set, then clears those bits.
    pub fn wait_all_clear(&self, mask: u32) -> KernelResult<u32> {
        self.get(mask, GetOption::AndClear, WaitOption::Forever)
    }

    /// Clears the bits of `mask`.
    pub fn clear(&self, mask: u32) -> KernelResult<()> {
        self.set(!mask, SetOption::And)
    }

    pub fn clear_all(&self) -> KernelResult<()> {
        self.set(0, SetOption::And)
    }

    /// Non-destructive peek at the current group.
    pub fn flags(&self) -> KernelResult<u32> {
        let cb = self.cb("flags_current")?;
        let current = cb.state.lock().current;
        Ok(current)
    }

    /// Installs the hook run after every successful `set`, outside the
    /// object lock. Replaces any previous hook.
    pub fn set_notify(&self, hook: impl Fn() + Send + Sync + 'static) -> KernelResult<()> {
        let cb = self.cb("flags_set_notify")?;
        self.shared.log.debug(format_args!("set_notify(..)"));
        cb.state.lock().hook = Some(Arc::new(hook));
        Ok(())
    }

    pub fn info(&self) -> KernelResult<EventFlagsInfo> {
        let cb = self.cb("flags_info")?;
        let state = cb.state.lock();
        Ok(EventFlagsInfo {
            name: self.shared.log.name().to_string(),
            current: state.current,
            waiting: state.waiters.waiting_count(),
            first_waiter: state.waiters.first_waiting_name(),
        })
    }

    pub fn performance(&self) -> KernelResult<FlagsPerf> {
        let cb = self.cb("flags_performance")?;
        let perf = cb.state.lock().perf;
        Ok(perf)
    }
}

impl KernelObject for EventFlags {
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
                self.shared.log.error_status("flags_del", err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flags(kernel: &Arc<Kernel>, name: &str) -> EventFlags {
        let group = EventFlags::new(kernel, name);
        group.create().unwrap();
        group
    }

    #[test]
    fn and_clear_consumes_the_request() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "wake");
        group.set(0x0F, SetOption::Or).unwrap();
        assert_eq!(
            group.get(0x0F, GetOption::AndClear, WaitOption::NoWait),
            Ok(0x0F)
        );
        assert_eq!(group.flags().unwrap(), 0);
    }

    #[test]
    fn no_events_is_silent() {
        let kernel = Kernel::new();
        let sink = MemorySink::new();
        let group = EventFlags::with_sink(&kernel, "quiet", sink.clone());
        group.create().unwrap();
        assert_eq!(
            group.get(0x01, GetOption::And, WaitOption::NoWait),
            Err(KernelError::NoEvents)
        );
        assert!(sink.errors().is_empty());
    }

    #[test]
    fn and_needs_all_or_needs_any() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "match");
        group.set(0x05, SetOption::Or).unwrap();

        assert_eq!(
            group.get(0x0A, GetOption::Or, WaitOption::NoWait),
            Err(KernelError::NoEvents)
        );
        assert_eq!(group.get(0x04, GetOption::Or, WaitOption::NoWait), Ok(0x05));
        assert_eq!(
            group.get(0x07, GetOption::And, WaitOption::NoWait),
            Err(KernelError::NoEvents)
        );
        assert_eq!(group.get(0x05, GetOption::And, WaitOption::NoWait), Ok(0x05));
    }

    #[test]
    fn or_clear_takes_only_requested_bits() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "partial");
        group.set(0x0F, SetOption::Or).unwrap();
        assert_eq!(
            group.get(0x03, GetOption::OrClear, WaitOption::NoWait),
            Ok(0x0F)
        );
        assert_eq!(group.flags().unwrap(), 0x0C);
    }

    #[test]
    fn and_set_masks_the_group() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "mask");
        group.set(0xFF, SetOption::Or).unwrap();
        group.set(0x03, SetOption::And).unwrap();
        assert_eq!(group.flags().unwrap(), 0x03);
    }

    #[test]
    fn clear_family_removes_bits() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "clear");
        group.set(0xFF, SetOption::Or).unwrap();
        group.clear(0x0F).unwrap();
        assert_eq!(group.flags().unwrap(), 0xF0);
        group.clear_all().unwrap();
        assert_eq!(group.flags().unwrap(), 0);
    }

    #[test]
    fn is_set_checks_every_requested_bit() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "check");
        group.set(0x06, SetOption::Or).unwrap();
        assert_eq!(group.is_set(0x02), Ok(true));
        assert_eq!(group.is_set(0x06), Ok(true));
        // Requires all bits, not just an intersection.
        assert_eq!(group.is_set(0x07), Ok(false));
    }

    #[test]
    fn timed_out_polling_leaves_no_residue() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "polled");
        // Poll-with-timeout on a bit nobody sets.
        for _ in 0..50 {
            assert_eq!(
                group.get(0x01, GetOption::And, WaitOption::Ticks(1)),
                Err(KernelError::Timeout)
            );
        }
        let cb = Arc::clone(group.shared.cb.read().as_ref().unwrap());
        assert_eq!(cb.state.lock().waiters.len(), 0);
        assert_eq!(group.performance().unwrap().timeouts, 50);
    }

    #[test]
    fn set_notify_fires_without_waiters() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "notify");
        let fired = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&fired);
        group
            .set_notify(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        group.set(0x01, SetOption::Or).unwrap();
        group.clear_all().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delete_zeroes_and_frees_the_name() {
        let kernel = Kernel::new();
        let group = flags(&kernel, "cycle");
        group.set(0xAA, SetOption::Or).unwrap();
        group.del().unwrap();
        assert!(!group.is_created());
        group.create().unwrap();
        assert_eq!(group.flags().unwrap(), 0);
    }
}
