//! Priority-ordered suspension lists.
//!
//! Each blocking object keeps one (queues keep two: senders and receivers).
//! Entries are stored in release order: inserted after every entry of equal
//! or higher priority, which yields FIFO among equals. Release always picks
//! the *live* highest-priority entry, so a priority change applied to a
//! suspended thread reorders the list's effective order immediately,
//! matching what the scheduler would observe walking its suspension chain.
//!
//! Entries whose park cell was already claimed (timed out, aborted) stay in
//! the list as husks until the next scan prunes them; claiming the cell is
//! the only synchronization a waiter needs on its way out.

use std::sync::Arc;

use super::threads::ThreadCb;

/// Bookkeeping every waiter embeds.
pub(crate) struct WaiterCore {
    thread: Option<Arc<ThreadCb>>,
    fallback_priority: u8,
    seq: u64,
}

impl WaiterCore {
    pub(crate) fn new(seq: u64, thread: Option<Arc<ThreadCb>>, fallback_priority: u8) -> Self {
        Self {
            thread,
            fallback_priority,
            seq,
        }
    }

    /// Live priority: kernel threads are read through their control block so
    /// mid-wait priority changes take effect; external threads use the
    /// kernel's configured fallback.
    pub(crate) fn priority(&self) -> u8 {
        match &self.thread {
            Some(cb) => cb.priority(),
            None => self.fallback_priority,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn thread_name(&self) -> Option<String> {
        self.thread.as_ref().map(|cb| cb.name().to_string())
    }
}

/// Implemented by each object kind's waiter record.
pub(crate) trait Suspended {
    fn core(&self) -> &WaiterCore;
    /// Whether the waiter's park cell is still unclaimed.
    fn is_waiting(&self) -> bool;
}

pub(crate) struct WaitList<W> {
    entries: Vec<Arc<W>>,
    next_seq: u64,
}

impl<W: Suspended> WaitList<W> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert in release order: after every entry of >= priority.
    pub(crate) fn insert(&mut self, waiter: Arc<W>) {
        let priority = waiter.core().priority();
        let at = self
            .entries
            .iter()
            .rposition(|w| w.core().priority() >= priority)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.entries.insert(at, waiter);
    }

    /// Drops every entry whose cell was already claimed. Wakers prune on
    /// their scans; a waiter that leaves by timeout, abort, or termination
    /// prunes on its way out so unserved objects do not accumulate husks.
    pub(crate) fn prune(&mut self) {
        self.entries.retain(|w| w.is_waiting());
    }

    /// Remove and return the live waiter with the highest priority,
    /// earliest arrival among equals, that also satisfies `pred`.
    pub(crate) fn take_best_where<F>(&mut self, mut pred: F) -> Option<Arc<W>>
    where
        F: FnMut(&W) -> bool,
    {
        self.prune();
        let mut best: Option<(usize, u8, u64)> = None;
        for (i, w) in self.entries.iter().enumerate() {
            if !pred(w) {
                continue;
            }
            let priority = w.core().priority();
            let seq = w.core().seq();
            let better = match best {
                None => true,
                Some((_, bp, bs)) => priority > bp || (priority == bp && seq < bs),
            };
            if better {
                best = Some((i, priority, seq));
            }
        }
        best.map(|(i, _, _)| self.entries.remove(i))
    }

    pub(crate) fn take_best(&mut self) -> Option<Arc<W>> {
        self.take_best_where(|_| true)
    }

    /// Promote the current best waiter to the stored front. Release order is
    /// unaffected (the scan already picks the best); the promotion is what
    /// `info()` reports as the first suspended thread.
    pub(crate) fn prioritize(&mut self) {
        self.prune();
        let mut best: Option<(usize, u8, u64)> = None;
        for (i, w) in self.entries.iter().enumerate() {
            let priority = w.core().priority();
            let seq = w.core().seq();
            let better = match best {
                None => true,
                Some((_, bp, bs)) => priority > bp || (priority == bp && seq < bs),
            };
            if better {
                best = Some((i, priority, seq));
            }
        }
        if let Some((i, _, _)) = best {
            if i > 0 {
                let w = self.entries.remove(i);
                self.entries.insert(0, w);
            }
        }
    }

    /// Empty the list, returning every entry (dead ones included; waking a
    /// dead entry is a no-op for the caller).
    pub(crate) fn drain(&mut self) -> Vec<Arc<W>> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.entries.iter().filter(|w| w.is_waiting()).count()
    }

    /// Stored entries, husks included.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn first_waiting_name(&self) -> Option<String> {
        self.entries
            .iter()
            .find(|w| w.is_waiting())
            .and_then(|w| w.core().thread_name())
    }
}
