//! Producers and a consumer over a fixed-size message queue.
//!
//! Three producers outrun a single consumer on an eight-slot queue, so
//! sends park on the full queue and get admitted one at a time as the
//! consumer frees slots. Completion is gathered on an event-flag group,
//! and the shared operation log is dumped at the end.

use std::sync::Arc;
use std::time::Duration;

use keel::{
    EventFlags, GetOption, Kernel, KernelObject, MemorySink, Queue, SetOption, Thread,
    ThreadConfig, ThreadPriority, WaitOption,
};

const PRODUCERS: u32 = 3;
const PER_PRODUCER: u64 = 8;
const CONSUMER_DONE: u32 = 1 << 31;

fn main() {
    let kernel = Kernel::new();
    let sink = MemorySink::new();

    let jobs = Queue::with_sink(&kernel, "jobs", sink.clone());
    // Eight 8-byte slots.
    jobs.create(8, vec![0u8; 64]).expect("queue create");

    let done = EventFlags::with_sink(&kernel, "done", sink.clone());
    done.create().expect("flags create");

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let q = jobs.clone();
        let d = done.clone();
        let t = Thread::new(
            &kernel,
            ThreadConfig::new(format!("producer-{p}")).with_priority(ThreadPriority(20)),
            move || {
                for n in 0..PER_PRODUCER {
                    let job = (u64::from(p) << 32) | n;
                    q.send(&job.to_le_bytes(), WaitOption::Forever)
                        .expect("send");
                }
                d.set(1 << p, SetOption::Or).expect("done bit");
            },
        );
        t.create_and_resume().expect("producer start");
        producers.push(t);
    }

    let q = jobs.clone();
    let d = done.clone();
    let consumer = Thread::new(
        &kernel,
        ThreadConfig::new("consumer").with_priority(ThreadPriority(30)),
        move || {
            let mut buf = [0u8; 8];
            for _ in 0..(u64::from(PRODUCERS) * PER_PRODUCER) {
                q.receive(&mut buf, WaitOption::Forever).expect("receive");
                let job = u64::from_le_bytes(buf);
                println!(
                    "consumed job {} from producer-{}",
                    job & 0xFFFF_FFFF,
                    job >> 32
                );
                // Slower than the producers, so the queue fills up.
                std::thread::sleep(Duration::from_millis(5));
            }
            d.set(CONSUMER_DONE, SetOption::Or).expect("done bit");
        },
    );
    consumer.create_and_resume().expect("consumer start");

    let all = ((1 << PRODUCERS) - 1) | CONSUMER_DONE;
    done.get(all, GetOption::AndClear, WaitOption::Forever)
        .expect("gather");

    let perf = jobs.performance().expect("queue perf");
    println!();
    println!(
        "queue counters: sent = {}, received = {}, full suspensions = {}, empty suspensions = {}",
        perf.sent, perf.received, perf.full_suspensions, perf.empty_suspensions
    );

    jobs.del().expect("queue del");
    done.del().expect("flags del");
    println!();
    println!("operation log:");
    for (severity, line) in sink.lines() {
        println!("  [{severity:?}] {line}");
    }
}
