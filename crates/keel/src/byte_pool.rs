//! Byte pools over caller-supplied regions.
//!
//! Allocation is strictly non-blocking: there is no wait option at all,
//! because callers allocate where suspension is unacceptable. Exhaustion
//! reports `None` after an ERROR log and the caller decides what to do.
//!
//! A successful allocation mints a [`PoolBlock`] token. The token is not
//! clonable and `release` consumes it, so a double release is impossible to
//! write; a token minted by another pool (or kept across a recreation) is
//! rejected with `UnknownBlock`. Unlike the blocking objects, the whole
//! pool lives in one `Mutex<Option<PoolState>>` monitor, which doubles as
//! the created flag and lets [`BytePool::bytes`] hand out a mapped guard
//! over a block's bytes.

use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelObject, ObjectId, ObjectKind};
use crate::logging::{default_sink, ObjectLog, SharedSink};

const LOG_TARGET: &str = "keel::byte_pool";

/// Token for one allocated block. Move-only; give it back with
/// [`BytePool::release`].
#[derive(Debug)]
pub struct PoolBlock {
    pool: ObjectId,
    offset: usize,
    size: usize,
}

impl PoolBlock {
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Cumulative counters reported by [`BytePool::performance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolPerf {
    pub allocates: u64,
    pub releases: u64,
    pub failures: u64,
}

/// Snapshot reported by [`BytePool::info`].
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub name: String,
    pub free_bytes: usize,
    pub live_blocks: usize,
}

struct PoolState {
    id: ObjectId,
    region: Vec<u8>,
    /// Live carves as `(offset, size)`, sorted by offset.
    live: Vec<(usize, usize)>,
    perf: PoolPerf,
}

impl PoolState {
    fn first_fit(&self, size: usize) -> Option<usize> {
        let mut prev_end = 0;
        for &(offset, len) in &self.live {
            if offset - prev_end >= size {
                return Some(prev_end);
            }
            prev_end = offset + len;
        }
        if self.region.len() - prev_end >= size {
            return Some(prev_end);
        }
        None
    }

    fn free_bytes(&self) -> usize {
        let used: usize = self.live.iter().map(|&(_, len)| len).sum();
        self.region.len() - used
    }
}

struct Shared {
    kernel: Arc<Kernel>,
    log: ObjectLog,
    state: Mutex<Option<PoolState>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(state) = self.state.get_mut().take() {
            self.log.debug(format_args!("del() on drop"));
            self.kernel
                .unregister(ObjectKind::BytePool, self.log.name(), state.id);
        }
    }
}

/// Named byte-pool handle. Clones share the same object.
#[derive(Clone)]
pub struct BytePool {
    shared: Arc<Shared>,
}

impl BytePool {
    pub fn new(kernel: &Arc<Kernel>, name: impl Into<String>) -> Self {
        Self::with_sink(kernel, name, default_sink())
    }

    pub fn with_sink(kernel: &Arc<Kernel>, name: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                kernel: Arc::clone(kernel),
                log: ObjectLog::new("BytePool", LOG_TARGET, name.into(), sink),
                state: Mutex::new(None),
            }),
        }
    }

    /// Registers the pool over the caller-allocated region. Creating an
    /// already created pool tears the old object down first and reports the
    /// recreation at INFO.
    pub fn create(&self, region: Vec<u8>) -> KernelResult<()> {
        if region.is_empty() {
            let err = KernelError::InvalidParameter;
            self.shared.log.error_status("pool_create", err);
            return Err(err);
        }
        let size = region.len();
        let mut guard = self.shared.state.lock();
        if let Some(old) = guard.take() {
            self.shared.log.info(format_args!("create() recreating"));
            self.shared
                .kernel
                .unregister(ObjectKind::BytePool, self.shared.log.name(), old.id);
        }
        let id = match self
            .shared
            .kernel
            .register(ObjectKind::BytePool, self.shared.log.name())
        {
            Ok(id) => id,
            Err(err) => {
                drop(guard);
                self.shared.log.error_status("pool_create", err);
                return Err(err);
            }
        };
        *guard = Some(PoolState {
            id,
            region,
            live: Vec::new(),
            perf: PoolPerf::default(),
        });
        drop(guard);
        self.shared.log.debug(format_args!("create({size} bytes)"));
        Ok(())
    }

    /// First-fit carve of `size` bytes. Never parks: exhaustion logs an
    /// ERROR and reports `None`.
    pub fn allocate(&self, size: usize) -> Option<PoolBlock> {
        if size == 0 {
            self.shared
                .log
                .error_status("pool_allocate", KernelError::InvalidParameter);
            return None;
        }
        let outcome = {
            let mut guard = self.shared.state.lock();
            match guard.as_mut() {
                None => Err(KernelError::NotCreated),
                Some(state) => match state.first_fit(size) {
                    Some(offset) => {
                        let at = state
                            .live
                            .iter()
                            .position(|&(o, _)| o > offset)
                            .unwrap_or(state.live.len());
                        state.live.insert(at, (offset, size));
                        state.perf.allocates += 1;
                        Ok(PoolBlock {
                            pool: state.id,
                            offset,
                            size,
                        })
                    }
                    None => {
                        state.perf.failures += 1;
                        Err(KernelError::NoMemory)
                    }
                },
            }
        };
        match outcome {
            Ok(block) => {
                self.shared
                    .log
                    .debug(format_args!("allocate({size}) -> offset {}", block.offset));
                Some(block)
            }
            Err(err) => {
                self.shared.log.error_status("pool_allocate", err);
                None
            }
        }
    }

    /// Returns a block to the pool. Consumes the token; a token this pool
    /// did not mint fails with `UnknownBlock`.
    pub fn release(&self, block: PoolBlock) -> KernelResult<()> {
        let outcome = {
            let mut guard = self.shared.state.lock();
            match guard.as_mut() {
                None => Err(KernelError::NotCreated),
                Some(state) if block.pool != state.id => Err(KernelError::UnknownBlock),
                Some(state) => {
                    match state
                        .live
                        .iter()
                        .position(|&entry| entry == (block.offset, block.size))
                    {
                        Some(at) => {
                            state.live.remove(at);
                            state.perf.releases += 1;
                            Ok(())
                        }
                        None => Err(KernelError::UnknownBlock),
                    }
                }
            }
        };
        match outcome {
            Ok(()) => {
                self.shared
                    .log
                    .debug(format_args!("release(offset {})", block.offset));
                Ok(())
            }
            Err(err) => {
                self.shared.log.error_status("pool_release", err);
                Err(err)
            }
        }
    }

    /// Locked view of a live block's bytes. The pool stays locked for the
    /// guard's lifetime, so keep it short.
    pub fn bytes(&self, block: &PoolBlock) -> KernelResult<MappedMutexGuard<'_, [u8]>> {
        let guard = self.shared.state.lock();
        let err = match guard.as_ref() {
            None => Some(KernelError::NotCreated),
            Some(state)
                if block.pool != state.id || !state.live.contains(&(block.offset, block.size)) =>
            {
                Some(KernelError::UnknownBlock)
            }
            Some(_) => None,
        };
        if let Some(err) = err {
            drop(guard);
            self.shared.log.error_status("pool_bytes", err);
            return Err(err);
        }
        match MutexGuard::try_map(guard, |state| {
            state
                .as_mut()
                .map(|s| &mut s.region[block.offset..block.offset + block.size])
        }) {
            Ok(bytes) => Ok(bytes),
            Err(_) => Err(KernelError::NotCreated),
        }
    }

    pub fn free_bytes(&self) -> KernelResult<usize> {
        match self.shared.state.lock().as_ref() {
            Some(state) => Ok(state.free_bytes()),
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status("pool_free_bytes", err);
                Err(err)
            }
        }
    }

    pub fn info(&self) -> KernelResult<PoolInfo> {
        match self.shared.state.lock().as_ref() {
            Some(state) => Ok(PoolInfo {
                name: self.shared.log.name().to_string(),
                free_bytes: state.free_bytes(),
                live_blocks: state.live.len(),
            }),
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status("pool_info", err);
                Err(err)
            }
        }
    }

    pub fn performance(&self) -> KernelResult<PoolPerf> {
        match self.shared.state.lock().as_ref() {
            Some(state) => Ok(state.perf),
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status("pool_performance", err);
                Err(err)
            }
        }
    }
}

impl KernelObject for BytePool {
    fn name(&self) -> &str {
        self.shared.log.name()
    }

    fn id(&self) -> Option<ObjectId> {
        self.shared.state.lock().as_ref().map(|state| state.id)
    }

    fn del(&self) -> KernelResult<()> {
        let taken = self.shared.state.lock().take();
        match taken {
            Some(state) => {
                self.shared.log.debug(format_args!("del()"));
                self.shared
                    .kernel
                    .unregister(ObjectKind::BytePool, self.shared.log.name(), state.id);
                Ok(())
            }
            None => {
                let err = KernelError::NotCreated;
                self.shared.log.error_status("pool_del", err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;

    fn pool(kernel: &Arc<Kernel>, name: &str, bytes: usize) -> BytePool {
        let p = BytePool::new(kernel, name);
        p.create(vec![0; bytes]).unwrap();
        p
    }

    #[test]
    fn carves_disjoint_blocks() {
        let kernel = Kernel::new();
        let p = pool(&kernel, "arena", 64);
        let a = p.allocate(16).unwrap();
        let b = p.allocate(16).unwrap();
        assert_eq!(p.free_bytes().unwrap(), 32);

        p.bytes(&a).unwrap().fill(0xAA);
        p.bytes(&b).unwrap().fill(0xBB);
        assert!(p.bytes(&a).unwrap().iter().all(|&x| x == 0xAA));
        assert!(p.bytes(&b).unwrap().iter().all(|&x| x == 0xBB));

        p.release(a).unwrap();
        p.release(b).unwrap();
        assert_eq!(p.free_bytes().unwrap(), 64);
    }

    #[test]
    fn exhaustion_reports_none_and_logs() {
        let kernel = Kernel::new();
        let sink = MemorySink::new();
        let p = BytePool::with_sink(&kernel, "tight", sink.clone());
        p.create(vec![0; 32]).unwrap();
        let _keep = p.allocate(24).unwrap();
        assert!(p.allocate(16).is_none());
        assert!(sink.errors().iter().any(|line| line.contains("0x19")));
        assert_eq!(p.performance().unwrap().failures, 1);
    }

    #[test]
    fn first_fit_reuses_gaps() {
        let kernel = Kernel::new();
        let p = pool(&kernel, "gaps", 48);
        let _a = p.allocate(16).unwrap();
        let b = p.allocate(16).unwrap();
        let _c = p.allocate(16).unwrap();

        p.release(b).unwrap();
        assert_eq!(p.free_bytes().unwrap(), 16);
        // Both fit inside the freed middle gap.
        let g1 = p.allocate(8).unwrap();
        let g2 = p.allocate(8).unwrap();
        assert_eq!(p.free_bytes().unwrap(), 0);
        assert!(p.allocate(1).is_none());
        p.release(g1).unwrap();
        p.release(g2).unwrap();
    }

    #[test]
    fn foreign_and_stale_tokens_are_rejected() {
        let kernel = Kernel::new();
        let p1 = pool(&kernel, "one", 32);
        let p2 = pool(&kernel, "two", 32);
        let block = p1.allocate(8).unwrap();
        let stale = p1.allocate(8).unwrap();

        assert_eq!(p2.release(block), Err(KernelError::UnknownBlock));

        // Recreation invalidates outstanding tokens.
        p1.create(vec![0; 32]).unwrap();
        assert_eq!(p1.release(stale), Err(KernelError::UnknownBlock));
    }

    #[test]
    fn zero_size_allocation_is_refused() {
        let kernel = Kernel::new();
        let sink = MemorySink::new();
        let p = BytePool::with_sink(&kernel, "zero", sink.clone());
        p.create(vec![0; 16]).unwrap();
        assert!(p.allocate(0).is_none());
        assert!(sink.errors().iter().any(|line| line.contains("0x11")));
    }

    #[test]
    fn empty_region_is_refused() {
        let kernel = Kernel::new();
        let p = BytePool::new(&kernel, "hollow");
        assert_eq!(p.create(Vec::new()), Err(KernelError::InvalidParameter));
        assert!(!p.is_created());
    }

    #[test]
    fn bytes_view_checks_the_token() {
        let kernel = Kernel::new();
        let p = pool(&kernel, "view", 16);
        let block = p.allocate(8).unwrap();
        {
            let mut view = p.bytes(&block).unwrap();
            view.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        }
        assert_eq!(&p.bytes(&block).unwrap()[..3], &[1, 2, 3]);

        p.release(block).unwrap();
        // The token is gone; a kept reference cannot be, but a released
        // (offset, size) pair no longer maps.
        let other = pool(&kernel, "other", 16);
        let foreign = other.allocate(8).unwrap();
        assert_eq!(
            p.bytes(&foreign).map(|_| ()),
            Err(KernelError::UnknownBlock)
        );
    }
}
