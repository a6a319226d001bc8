//! Join rendezvous over pooled result buffers.
//!
//! A supervisor releases workers one at a time through per-worker gate
//! semaphores, joins each worker, and reads back the result the worker
//! staged in a shared byte pool. A periodic heartbeat ticks alongside and
//! is stopped once every worker has been joined.

use std::sync::Arc;

use parking_lot::Mutex;

use keel::{
    BytePool, Kernel, KernelObject, PeriodicThread, PoolBlock, Semaphore, Thread, ThreadConfig,
    ThreadPriority, WaitOption,
};

const WORKERS: u32 = 4;

fn main() {
    let kernel = Kernel::new();

    let pool = BytePool::new(&kernel, "results");
    pool.create(vec![0u8; 256]).expect("pool create");

    let staged: Arc<Mutex<Vec<(String, PoolBlock)>>> = Arc::new(Mutex::new(Vec::new()));

    let heartbeat = PeriodicThread::new(
        &kernel,
        ThreadConfig::new("heartbeat").with_priority(ThreadPriority(40)),
        50,
        || println!("  ...tick"),
    );
    heartbeat.start().expect("heartbeat start");

    let mut gates = Vec::new();
    let mut workers = Vec::new();
    for w in 0..WORKERS {
        let gate = Semaphore::new(&kernel, format!("gate-{w}"));
        gate.create(0).expect("gate create");

        let k = Arc::clone(&kernel);
        let g = gate.clone();
        let p = pool.clone();
        let out = Arc::clone(&staged);
        let name = format!("worker-{w}");
        let tag = name.clone();
        let t = Thread::new(
            &kernel,
            ThreadConfig::new(name).with_priority(ThreadPriority(16)),
            move || {
                g.get(WaitOption::Forever).expect("gate");
                let block = p.allocate(16).expect("allocate");
                {
                    let mut bytes = p.bytes(&block).expect("bytes");
                    for (i, b) in bytes.iter_mut().enumerate() {
                        *b = (w as u8) * 16 + i as u8;
                    }
                }
                out.lock().push((tag.clone(), block));
                // Stay alive long enough for the supervisor's join.
                let _ = k.sleep(30);
            },
        );
        t.create_and_resume().expect("worker start");
        gates.push(gate);
        workers.push(t);
    }

    for (gate, worker) in gates.iter().zip(&workers) {
        gate.put().expect("gate put");
        worker.join().expect("join");
        println!("joined {}", worker.name());
    }

    heartbeat.stop().expect("heartbeat stop");

    for (tag, block) in staged.lock().drain(..) {
        let sum: u32 = pool
            .bytes(&block)
            .expect("bytes")
            .iter()
            .map(|b| u32::from(*b))
            .sum();
        println!("{tag}: staged {} bytes, checksum {sum}", block.size());
        pool.release(block).expect("release");
    }
    println!("pool free bytes: {}", pool.free_bytes().expect("free"));
}
