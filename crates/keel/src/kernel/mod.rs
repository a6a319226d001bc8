//! The kernel collaborator behind every object handle.
//!
//! ## Module Overview
//!
//! - [`Kernel`] owns the object registry and the tick clock. Handles hold it
//!   through an `Arc` and call into it for identifier assignment, name
//!   bookkeeping, and tick-to-duration conversion.
//! - [`KernelConfig`] and [`KernelConfigBuilder`] select the tick rate, the
//!   registry capacity, and the priority charged to external (non-kernel)
//!   threads when they block on an object.
//! - [`KernelObject`] is the surface every named handle exposes: `name()`,
//!   `id()`, the derived `is_created()`, and `del()`.
//! - The submodules carry the blocking machinery: one-shot park cells,
//!   priority-ordered suspension lists, and thread control blocks.
//!
//! Blocking is real: a waiter parks its host thread on a condvar and is
//! released by the thread that posts, deletes, aborts, or terminates. The
//! scheduler underneath is the host OS; priorities decide release *order*,
//! not preemption.

pub(crate) mod park;
pub(crate) mod threads;
pub(crate) mod waitlist;

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::wait::WaitOption;

use park::{ParkCell, WakeStatus};

/// Priorities run `0..=MAX_PRIORITY`, larger is more urgent.
pub(crate) const MAX_PRIORITY: u8 = 63;

/// What a registry slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    Semaphore,
    EventFlags,
    Queue,
    BytePool,
    Thread,
}

impl ObjectKind {
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Semaphore => "semaphore",
            ObjectKind::EventFlags => "event-flags",
            ObjectKind::Queue => "queue",
            ObjectKind::BytePool => "byte-pool",
            ObjectKind::Thread => "thread",
        }
    }
}

/// Nonzero identifier assigned at registration. A handle whose slot holds
/// no identifier is not created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    const FIRST: ObjectId = ObjectId(NonZeroU64::MIN);

    #[cfg(test)]
    pub(crate) fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    fn next(self) -> Self {
        ObjectId(self.0.saturating_add(1))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Tick clock rate used to convert tick counts into host durations.
    pub tick_rate_hz: u32,
    /// Registry capacity across all object kinds.
    pub max_objects: usize,
    /// Priority charged to external host threads suspended on an object.
    pub external_waiter_priority: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 1000,
            max_objects: 256,
            external_waiter_priority: 0,
        }
    }
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct KernelConfigBuilder {
    tick_rate_hz: Option<u32>,
    max_objects: Option<usize>,
    external_waiter_priority: Option<u8>,
}

impl KernelConfigBuilder {
    pub fn tick_rate_hz(mut self, hz: u32) -> Self {
        self.tick_rate_hz = Some(hz);
        self
    }

    pub fn max_objects(mut self, max: usize) -> Self {
        self.max_objects = Some(max);
        self
    }

    pub fn external_waiter_priority(mut self, priority: u8) -> Self {
        self.external_waiter_priority = Some(priority);
        self
    }

    pub fn build(self) -> KernelResult<KernelConfig> {
        let defaults = KernelConfig::default();
        let config = KernelConfig {
            tick_rate_hz: self.tick_rate_hz.unwrap_or(defaults.tick_rate_hz),
            max_objects: self.max_objects.unwrap_or(defaults.max_objects),
            external_waiter_priority: self
                .external_waiter_priority
                .unwrap_or(defaults.external_waiter_priority),
        };
        if config.tick_rate_hz == 0
            || config.max_objects == 0
            || config.external_waiter_priority > MAX_PRIORITY
        {
            return Err(KernelError::InvalidParameter);
        }
        Ok(config)
    }
}

struct Registry {
    next_id: ObjectId,
    live: BTreeMap<(ObjectKind, String), ObjectId>,
}

pub struct Kernel {
    config: KernelConfig,
    registry: Mutex<Registry>,
}

impl Kernel {
    pub fn new() -> Arc<Self> {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Mutex::new(Registry {
                next_id: ObjectId::FIRST,
                live: BTreeMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Names are unique per kind while the object lives.
    pub(crate) fn register(&self, kind: ObjectKind, name: &str) -> KernelResult<ObjectId> {
        if name.is_empty() {
            return Err(KernelError::InvalidParameter);
        }
        let mut reg = self.registry.lock();
        if reg.live.len() >= self.config.max_objects {
            return Err(KernelError::RegistryFull);
        }
        let key = (kind, name.to_string());
        if reg.live.contains_key(&key) {
            return Err(KernelError::DuplicateName);
        }
        let id = reg.next_id;
        reg.next_id = id.next();
        reg.live.insert(key, id);
        Ok(id)
    }

    /// The identifier check keeps a stale teardown from unhooking a
    /// recreated object that reused the name.
    pub(crate) fn unregister(&self, kind: ObjectKind, name: &str, id: ObjectId) {
        let mut reg = self.registry.lock();
        let key = (kind, name.to_string());
        if reg.live.get(&key) == Some(&id) {
            reg.live.remove(&key);
        }
    }

    pub fn object_count(&self) -> usize {
        self.registry.lock().live.len()
    }

    pub fn tick_period(&self) -> Duration {
        // Config fields are public; a hand-built zero rate must not divide.
        Duration::from_secs(1) / self.config.tick_rate_hz.max(1)
    }

    pub fn ticks(&self, ticks: u32) -> Duration {
        self.tick_period() * ticks
    }

    pub(crate) fn deadline(&self, wait: WaitOption) -> Option<Instant> {
        match wait {
            WaitOption::Ticks(n) => Some(Instant::now() + self.ticks(n)),
            WaitOption::NoWait | WaitOption::Forever => None,
        }
    }

    pub(crate) fn external_waiter_priority(&self) -> u8 {
        self.config.external_waiter_priority
    }

    /// Suspends the calling thread for a tick count. A kernel thread parks
    /// on a fresh cell so termination and wait-abort reach it; an external
    /// thread just sleeps.
    pub fn sleep(&self, ticks: u32) -> KernelResult<()> {
        let duration = self.ticks(ticks);
        if threads::current_cb().is_some() {
            let cell: Arc<ParkCell<()>> = ParkCell::new();
            let (status, _) = block_on_cell(&cell, Some(Instant::now() + duration));
            match status {
                WakeStatus::TimedOut => Ok(()),
                WakeStatus::Aborted => Err(KernelError::WaitAborted),
                WakeStatus::Terminated => Err(KernelError::Terminated),
                // Nothing else holds the cell.
                WakeStatus::Granted | WakeStatus::Deleted => Ok(()),
            }
        } else {
            std::thread::sleep(duration);
            Ok(())
        }
    }

    /// Yields the host scheduler and honors pending suspension or
    /// termination of the calling kernel thread.
    pub fn relinquish(&self) -> KernelResult<()> {
        std::thread::yield_now();
        match threads::current_cb() {
            Some(cb) => cb.checkpoint(),
            None => Ok(()),
        }
    }

    pub fn current_thread_id(&self) -> Option<ObjectId> {
        threads::current_cb().map(|cb| cb.id())
    }

    pub fn current_thread_name(&self) -> Option<String> {
        threads::current_cb().map(|cb| cb.name().to_string())
    }
}

/// Parks the calling thread on `cell`, routing through its control block
/// when it is a kernel thread so suspension, wait-abort, and termination
/// observe the wait. Termination discovered on the way out overrides the
/// wake status.
pub(crate) fn block_on_cell<P: Send + 'static>(
    cell: &Arc<ParkCell<P>>,
    deadline: Option<Instant>,
) -> (WakeStatus, Option<P>) {
    match threads::current_cb() {
        Some(cb) => {
            if !cb.begin_wait(cell.clone()) {
                return (WakeStatus::Terminated, None);
            }
            let outcome = cell.park(deadline);
            match cb.finish_wait() {
                Ok(()) => outcome,
                Err(_) => (WakeStatus::Terminated, None),
            }
        }
        None => cell.park(deadline),
    }
}

/// Common surface of every named handle.
pub trait KernelObject {
    fn name(&self) -> &str;

    /// Registry identifier, present while the object is created.
    fn id(&self) -> Option<ObjectId>;

    fn is_created(&self) -> bool {
        self.id().is_some()
    }

    /// Tears the object down, releasing every suspended thread.
    fn del(&self) -> KernelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_degenerate_configs() {
        assert_eq!(
            KernelConfig::builder().tick_rate_hz(0).build().unwrap_err(),
            KernelError::InvalidParameter
        );
        assert_eq!(
            KernelConfig::builder().max_objects(0).build().unwrap_err(),
            KernelError::InvalidParameter
        );
        assert_eq!(
            KernelConfig::builder()
                .external_waiter_priority(64)
                .build()
                .unwrap_err(),
            KernelError::InvalidParameter
        );
        let config = KernelConfig::builder().tick_rate_hz(100).build().unwrap();
        assert_eq!(config.tick_rate_hz, 100);
        assert_eq!(config.max_objects, 256);
    }

    #[test]
    fn registry_enforces_names() {
        let kernel = Kernel::new();
        let id = kernel.register(ObjectKind::Semaphore, "a").unwrap();
        assert_eq!(
            kernel.register(ObjectKind::Semaphore, "a").unwrap_err(),
            KernelError::DuplicateName
        );
        assert_eq!(
            kernel.register(ObjectKind::Semaphore, "").unwrap_err(),
            KernelError::InvalidParameter
        );
        // Kinds namespace independently.
        kernel.register(ObjectKind::Queue, "a").unwrap();
        assert_eq!(kernel.object_count(), 2);

        kernel.unregister(ObjectKind::Semaphore, "a", id);
        let again = kernel.register(ObjectKind::Semaphore, "a").unwrap();
        assert_ne!(again, id);
    }

    #[test]
    fn registry_capacity_is_bounded() {
        let config = KernelConfig::builder().max_objects(1).build().unwrap();
        let kernel = Kernel::with_config(config);
        kernel.register(ObjectKind::Semaphore, "only").unwrap();
        assert_eq!(
            kernel.register(ObjectKind::Queue, "more").unwrap_err(),
            KernelError::RegistryFull
        );
    }

    #[test]
    fn tick_arithmetic_follows_the_rate() {
        let config = KernelConfig::builder().tick_rate_hz(100).build().unwrap();
        let kernel = Kernel::with_config(config);
        assert_eq!(kernel.tick_period(), Duration::from_millis(10));
        assert_eq!(kernel.ticks(5), Duration::from_millis(50));
    }

    #[test]
    fn sleep_from_an_external_thread_returns() {
        let kernel = Kernel::new();
        kernel.sleep(1).unwrap();
        assert!(kernel.current_thread_id().is_none());
    }
}
