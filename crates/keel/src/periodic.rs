//! Time-driven threads built on [`Thread`] and [`Kernel::sleep`].
//!
//! A [`PeriodicThread`] runs its body every `interval` ticks, optionally
//! after an initial delay and for a bounded number of runs. A
//! [`OneShotThread`] runs its body once after a delay. Both are plain
//! threads underneath: suspend, resume, terminate and join all work
//! through [`thread`](PeriodicThread::thread), and the sleeps in between
//! runs are kernel boundaries where suspension and termination land. A
//! wait-abort only cuts the sleep short: the next run fires immediately
//! and the schedule continues.

use std::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::thread::{Thread, ThreadConfig};

/// Whether the schedule outlives a sleep outcome. An aborted sleep means
/// the cycle was woken early, not ended; termination ends it.
fn survives(outcome: KernelResult<()>) -> bool {
    matches!(outcome, Ok(()) | Err(KernelError::WaitAborted))
}

/// Runs a body at a fixed tick interval.
#[derive(Clone)]
pub struct PeriodicThread {
    thread: Thread,
}

impl PeriodicThread {
    /// Immediate first run, then every `interval` ticks, forever.
    pub fn new(
        kernel: &Arc<Kernel>,
        config: ThreadConfig,
        interval: u32,
        body: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::with_schedule(kernel, config, 0, interval, None, body)
    }

    /// Full schedule: first run after `initial_delay` ticks, then every
    /// `interval` ticks, `runs` times (`None` runs forever). An interval
    /// below one tick is rounded up to one.
    pub fn with_schedule(
        kernel: &Arc<Kernel>,
        config: ThreadConfig,
        initial_delay: u32,
        interval: u32,
        runs: Option<u32>,
        body: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let interval = interval.max(1);
        let k = Arc::clone(kernel);
        let entry = move || {
            let mut remaining = match runs {
                Some(0) => return,
                other => other,
            };
            if initial_delay > 0 && !survives(k.sleep(initial_delay)) {
                return;
            }
            loop {
                body();
                if let Some(left) = remaining.as_mut() {
                    *left -= 1;
                    if *left == 0 {
                        return;
                    }
                }
                if !survives(k.sleep(interval)) {
                    return;
                }
            }
        };
        Self {
            thread: Thread::new(kernel, config, entry),
        }
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn start(&self) -> KernelResult<()> {
        self.thread.create_and_resume()
    }

    /// Terminates the cycle; a run already in progress finishes first.
    pub fn stop(&self) -> KernelResult<()> {
        self.thread.terminate()
    }
}

/// Runs a body once, `delay` ticks after start.
#[derive(Clone)]
pub struct OneShotThread {
    thread: Thread,
}

impl OneShotThread {
    pub fn new(
        kernel: &Arc<Kernel>,
        config: ThreadConfig,
        delay: u32,
        body: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let k = Arc::clone(kernel);
        let entry = move || {
            if delay == 0 || survives(k.sleep(delay)) {
                body();
            }
        };
        Self {
            thread: Thread::new(kernel, config, entry),
        }
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn start(&self) -> KernelResult<()> {
        self.thread.create_and_resume()
    }

    /// Cancels the shot if the delay is still running.
    pub fn stop(&self) -> KernelResult<()> {
        self.thread.terminate()
    }
}
