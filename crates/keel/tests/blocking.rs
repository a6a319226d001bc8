//! Cross-thread blocking behavior: timed waits, deletion, wait-abort and
//! priority-ordered release across the kernel objects.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use keel::{
    EventFlags, GetOption, Kernel, KernelError, KernelObject, MemorySink, Queue, Semaphore,
    SetOption, Thread, ThreadConfig, ThreadPriority, ThreadState, WaitOption,
};

fn worker(
    kernel: &Arc<Kernel>,
    name: &str,
    priority: u8,
    entry: impl Fn() + Send + Sync + 'static,
) -> Thread {
    Thread::new(
        kernel,
        ThreadConfig::new(name).with_priority(ThreadPriority(priority)),
        entry,
    )
}

fn wait_for(mut ready: impl FnMut() -> bool) {
    for _ in 0..400 {
        if ready() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within two seconds");
}

fn wait_finished(t: &Thread) {
    wait_for(|| {
        matches!(
            t.state(),
            Ok(ThreadState::Completed) | Ok(ThreadState::Terminated)
        )
    });
}

#[test]
fn timed_wait_expires_with_timeout() {
    let kernel = Kernel::new();
    let sem = Semaphore::new(&kernel, "empty");
    sem.create(0).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let waiter = {
        let sem = sem.clone();
        worker(&kernel, "waiter", 16, move || {
            *seen.lock() = Some(sem.get(WaitOption::Ticks(40)));
        })
    };
    waiter.create_and_resume().unwrap();
    waiter.join().unwrap();

    assert_eq!(*outcome.lock(), Some(Err(KernelError::Timeout)));
    assert_eq!(sem.performance().unwrap().timeouts, 1);
    assert_eq!(sem.info().unwrap().waiting, 0);
}

#[test]
fn deletion_wakes_every_waiter() {
    let kernel = Kernel::new();
    let sem = Semaphore::new(&kernel, "doomed");
    sem.create(0).unwrap();

    let woken = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for name in ["first", "second"] {
        let sem = sem.clone();
        let woken = Arc::clone(&woken);
        let t = worker(&kernel, name, 16, move || {
            // Get first, lock after: the receiver of `lock().push(get(..))`
            // is evaluated before the argument, which would hold the results
            // mutex across the parked wait and keep the second worker from
            // ever reaching its own get.
            let outcome = sem.get(WaitOption::Forever);
            woken.lock().push(outcome);
        });
        t.create_and_resume().unwrap();
        workers.push(t);
    }
    wait_for(|| sem.info().unwrap().waiting == 2);

    sem.del().unwrap();
    for t in &workers {
        wait_finished(t);
    }
    let woken = woken.lock();
    assert_eq!(woken.len(), 2);
    assert!(woken.iter().all(|r| *r == Err(KernelError::Deleted)));
}

#[test]
fn wait_abort_wakes_only_the_aborted_wait() {
    let kernel = Kernel::new();
    let flags = EventFlags::new(&kernel, "mask");
    flags.create().unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let f = flags.clone();
    let blocked = worker(&kernel, "blocked", 16, move || {
        *seen.lock() = Some(f.get(0x8000_0000, GetOption::And, WaitOption::Forever));
    });
    blocked.create_and_resume().unwrap();
    wait_for(|| flags.info().unwrap().waiting == 1);

    blocked.wait_abort().unwrap();
    wait_finished(&blocked);
    assert_eq!(*outcome.lock(), Some(Err(KernelError::WaitAborted)));
    assert_eq!(flags.info().unwrap().waiting, 0);
    // Nothing left to abort.
    assert_eq!(blocked.wait_abort(), Err(KernelError::NotWaiting));
}

#[test]
fn release_follows_priority_then_arrival() {
    let kernel = Kernel::new();
    let sem = Semaphore::new(&kernel, "ranked");
    sem.create(0).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    // Arrival order: first20, second20, high40.
    for (index, (name, priority)) in [("first20", 20u8), ("second20", 20), ("high40", 40)]
        .into_iter()
        .enumerate()
    {
        let sem_w = sem.clone();
        let order = Arc::clone(&order);
        let t = worker(&kernel, name, priority, move || {
            if sem_w.get(WaitOption::Forever).is_ok() {
                order.lock().push(name);
            }
        });
        t.create_and_resume().unwrap();
        wait_for(|| sem.info().unwrap().waiting == index + 1);
        workers.push(t);
    }

    for released in 1..=3 {
        sem.put().unwrap();
        wait_for(|| order.lock().len() == released);
    }
    assert_eq!(*order.lock(), vec!["high40", "first20", "second20"]);
    for t in &workers {
        wait_finished(t);
    }
}

#[test]
fn priority_change_reranks_a_parked_waiter() {
    let kernel = Kernel::new();
    let sem = Semaphore::new(&kernel, "rerank");
    sem.create(0).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for (index, (name, priority)) in [("low", 10u8), ("mid", 20)].into_iter().enumerate() {
        let sem_w = sem.clone();
        let order = Arc::clone(&order);
        let t = worker(&kernel, name, priority, move || {
            if sem_w.get(WaitOption::Forever).is_ok() {
                order.lock().push(name);
            }
        });
        t.create_and_resume().unwrap();
        wait_for(|| sem.info().unwrap().waiting == index + 1);
        workers.push(t);
    }
    assert_eq!(sem.info().unwrap().first_waiter.as_deref(), Some("mid"));

    // Raising the parked "low" must win the next release.
    workers[0].set_priority(ThreadPriority(50)).unwrap();
    sem.prioritize().unwrap();
    assert_eq!(sem.info().unwrap().first_waiter.as_deref(), Some("low"));

    for released in 1..=2 {
        sem.put().unwrap();
        wait_for(|| order.lock().len() == released);
    }
    assert_eq!(*order.lock(), vec!["low", "mid"]);
    for t in &workers {
        wait_finished(t);
    }
}

#[test]
fn queue_producer_consumer_with_backpressure() {
    let kernel = Kernel::new();
    let q = Queue::new(&kernel, "work");
    // Four 8-byte slots.
    q.create(8, vec![0u8; 32]).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&received);
    let qc = q.clone();
    let consumer = worker(&kernel, "consumer", 20, move || {
        let mut buf = [0u8; 8];
        for _ in 0..10 {
            qc.receive(&mut buf, WaitOption::Forever).unwrap();
            seen.lock().push(u64::from_le_bytes(buf));
            // Slower than the producer so the queue fills.
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    consumer.create_and_resume().unwrap();
    wait_for(|| q.info().unwrap().waiting_receivers == 1);

    let qp = q.clone();
    let producer = worker(&kernel, "producer", 20, move || {
        for n in 0u64..10 {
            qp.send(&n.to_le_bytes(), WaitOption::Forever).unwrap();
        }
    });
    producer.create_and_resume().unwrap();

    wait_for(|| received.lock().len() == 10);
    wait_finished(&consumer);
    wait_finished(&producer);

    assert_eq!(*received.lock(), (0u64..10).collect::<Vec<_>>());
    let perf = q.performance().unwrap();
    assert_eq!(perf.sent, 10);
    assert_eq!(perf.received, 10);
    // First receive parked on empty, and the slow consumer forced at
    // least one send to park on full.
    assert!(perf.empty_suspensions >= 1);
    assert!(perf.full_suspensions >= 1);
}

#[test]
fn flags_gather_releases_on_the_last_bit() {
    let kernel = Kernel::new();
    let flags = EventFlags::new(&kernel, "steps");
    flags.create().unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let f = flags.clone();
    let gather = worker(&kernel, "gather", 30, move || {
        *seen.lock() = Some(f.get(0x0F, GetOption::AndClear, WaitOption::Forever));
    });
    gather.create_and_resume().unwrap();
    wait_for(|| flags.info().unwrap().waiting == 1);

    for bit in [0x01u32, 0x02, 0x04] {
        flags.set(bit, SetOption::Or).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        // Still short of the full mask.
        assert_eq!(flags.info().unwrap().waiting, 1);
    }
    flags.set(0x08, SetOption::Or).unwrap();
    wait_finished(&gather);

    assert_eq!(*outcome.lock(), Some(Ok(0x0F)));
    // AND_CLEAR consumed the whole request.
    assert_eq!(flags.flags().unwrap(), 0);
}

#[test]
fn expected_outcomes_never_reach_the_error_log() {
    let kernel = Kernel::new();
    let sink = MemorySink::new();
    let sem = Semaphore::with_sink(&kernel, "quiet", sink.clone());
    sem.create(0).unwrap();
    let flags = EventFlags::with_sink(&kernel, "quiet.flags", sink.clone());
    flags.create().unwrap();

    assert_eq!(sem.get(WaitOption::NoWait), Err(KernelError::WouldBlock));
    // Timed wait from this plain host thread, no kernel thread involved.
    assert_eq!(sem.get(WaitOption::Ticks(10)), Err(KernelError::Timeout));
    assert_eq!(
        flags.get(0x1, GetOption::Or, WaitOption::NoWait),
        Err(KernelError::NoEvents)
    );

    let parked = {
        let sem = sem.clone();
        std::thread::spawn(move || sem.get(WaitOption::Forever))
    };
    wait_for(|| sem.info().unwrap().waiting == 1);
    sem.del().unwrap();
    assert_eq!(parked.join().unwrap(), Err(KernelError::Deleted));

    assert!(sink.errors().is_empty());

    // A genuine failure does get logged, with its status code.
    assert_eq!(sem.get(WaitOption::NoWait), Err(KernelError::NotCreated));
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("sem_get() = 0x10"));
}
