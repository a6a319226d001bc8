//! # keel
//!
//! Named, lifecycle-managed synchronization primitives in the style of a
//! small real-time kernel: threads, counting semaphores, 32-bit event flag
//! groups, fixed-size message queues and first-fit byte pools, all owned by
//! a [`Kernel`] that registers objects by kind and name. Blocking services
//! rank waiters by thread priority the way a preemptive RTOS would, but
//! everything runs on ordinary host threads.
//!
//! ## Module Overview
//! - [`kernel`]      – Kernel handle, object registry, tick time base.
//! - [`thread`]      – Thread lifecycle, cooperative suspension, join.
//! - [`periodic`]    – Periodic and one-shot helper threads.
//! - [`semaphore`]   – Counting semaphore with an optional ceiling.
//! - [`event_flags`] – 32-bit flag groups with AND/OR rendezvous.
//! - [`queue`]       – Fixed-size message queues, front-send and flush.
//! - [`byte_pool`]   – Byte pools handing out move-only block tokens.
//! - [`error`]       – Status codes shared by every service.
//! - [`wait`]        – Wait options: no-wait, bounded ticks, forever.
//! - [`logging`]     – Per-object operation logs behind pluggable sinks.
//!
//! Handles are cheap clones sharing one underlying object; deleting an
//! object wakes every parked waiter with a status naming the reason.

pub mod byte_pool;
pub mod error;
pub mod event_flags;
pub mod kernel;
pub mod logging;
pub mod periodic;
pub mod queue;
pub mod semaphore;
pub mod thread;
pub mod wait;

pub use byte_pool::{BytePool, PoolBlock, PoolInfo, PoolPerf};
pub use error::{KernelError, KernelResult};
pub use event_flags::{EventFlags, EventFlagsInfo, FlagsPerf, GetOption, SetOption};
pub use kernel::{Kernel, KernelConfig, KernelConfigBuilder, KernelObject, ObjectId, ObjectKind};
pub use logging::{FacadeSink, LogSink, MemorySink, NullSink, Severity, SharedSink};
pub use periodic::{OneShotThread, PeriodicThread};
pub use queue::{Queue, QueueInfo, QueuePerf};
pub use semaphore::{Semaphore, SemaphoreInfo, SemaphorePerf};
pub use thread::{
    Thread, ThreadConfig, ThreadEvent, ThreadPriority, ThreadState, DEFAULT_STACK_SIZE,
};
pub use wait::WaitOption;
