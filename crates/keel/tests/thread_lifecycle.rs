//! Thread lifecycle integration: start gating, cooperative suspension,
//! termination, the emulated join rendezvous and notification ordering.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use keel::{
    Kernel, KernelError, MemorySink, Semaphore, Thread, ThreadConfig, ThreadEvent, ThreadState,
    WaitOption,
};

fn wait_for(mut ready: impl FnMut() -> bool) {
    for _ in 0..400 {
        if ready() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within two seconds");
}

#[test]
fn lifecycle_walks_created_suspended_completed() {
    let kernel = Kernel::new();
    let gate = Semaphore::new(&kernel, "gate");
    gate.create(0).unwrap();

    let g = gate.clone();
    let walker = Thread::new(&kernel, ThreadConfig::new("walker"), move || {
        let _ = g.get(WaitOption::Forever);
    });
    walker.create_thread().unwrap();
    assert_eq!(walker.state(), Ok(ThreadState::Created));
    assert!(!walker.is_current());

    walker.resume().unwrap();
    wait_for(|| gate.info().unwrap().waiting == 1);
    // Blocked on the gate reads as suspended from outside.
    assert_eq!(walker.state(), Ok(ThreadState::Suspended));

    gate.put().unwrap();
    wait_for(|| walker.state() == Ok(ThreadState::Completed));
    assert!(!walker.joinable());
}

#[test]
fn notification_reports_entry_then_exit() {
    let kernel = Kernel::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let observed = Thread::new(&kernel, ThreadConfig::new("observed"), || {});
    observed.create_thread().unwrap();
    observed
        .entry_exit_notify(move |event| seen.lock().push(event))
        .unwrap();

    observed.resume().unwrap();
    wait_for(|| events.lock().len() == 2);
    assert_eq!(*events.lock(), vec![ThreadEvent::Entry, ThreadEvent::Exit]);
    assert_eq!(observed.state(), Ok(ThreadState::Completed));
}

#[test]
fn join_returns_when_the_target_is_terminated() {
    let kernel = Kernel::new();
    let hold = Semaphore::new(&kernel, "hold");
    hold.create(0).unwrap();

    let h = hold.clone();
    let target = Thread::new(&kernel, ThreadConfig::new("target"), move || {
        let _ = h.get(WaitOption::Forever);
    });
    target.create_and_resume().unwrap();
    wait_for(|| hold.info().unwrap().waiting == 1);

    let joiner = {
        let target = target.clone();
        std::thread::spawn(move || target.join())
    };
    std::thread::sleep(Duration::from_millis(50));
    // The pending join occupies the notification slot.
    assert!(!target.joinable());
    assert_eq!(target.join(), Err(KernelError::NotJoinable));

    target.terminate().unwrap();
    assert_eq!(joiner.join().unwrap(), Ok(()));
    assert_eq!(target.state(), Ok(ThreadState::Terminated));
}

#[test]
fn self_join_is_refused() {
    let kernel = Kernel::new();
    let slot: Arc<OnceCell<Thread>> = Arc::new(OnceCell::new());
    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let me = Arc::clone(&slot);
    let narcissus = Thread::new(&kernel, ThreadConfig::new("narcissus"), move || {
        if let Some(handle) = me.get() {
            *seen.lock() = Some(handle.join());
        }
    });
    let _ = slot.set(narcissus.clone());

    narcissus.create_and_resume().unwrap();
    wait_for(|| outcome.lock().is_some());
    assert_eq!(*outcome.lock(), Some(Err(KernelError::DeadlockAvoided)));
}

#[test]
fn panicking_entry_ends_terminated_and_logs() {
    let kernel = Kernel::new();
    let sink = MemorySink::new();
    let bomb = Thread::with_sink(&kernel, ThreadConfig::new("bomb"), sink.clone(), || {
        std::thread::sleep(Duration::from_millis(50));
        panic!("boom");
    });
    bomb.create_and_resume().unwrap();
    // The exit notification still fires, so the join completes.
    bomb.join().unwrap();

    assert_eq!(bomb.state(), Ok(ThreadState::Terminated));
    let errors = sink.errors();
    assert!(errors.iter().any(|line| line.contains("entry panicked")));
}

#[test]
fn suspension_pauses_a_timed_loop() {
    let kernel = Kernel::new();
    let beats = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&beats);
    let k = Arc::clone(&kernel);
    let beater = Thread::new(&kernel, ThreadConfig::new("beater"), move || loop {
        seen.fetch_add(1, Ordering::SeqCst);
        if k.sleep(5).is_err() {
            return;
        }
    });
    beater.create_and_resume().unwrap();
    wait_for(|| beats.load(Ordering::SeqCst) >= 3);

    beater.suspend().unwrap();
    // Reaches the next sleep boundary and parks there.
    std::thread::sleep(Duration::from_millis(30));
    let frozen = beats.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(beats.load(Ordering::SeqCst), frozen);
    assert_eq!(beater.state(), Ok(ThreadState::Suspended));

    beater.resume().unwrap();
    wait_for(|| beats.load(Ordering::SeqCst) > frozen);
    beater.terminate().unwrap();
}

#[test]
fn services_refuse_a_terminated_thread() {
    let kernel = Kernel::new();
    let sem = Semaphore::new(&kernel, "post");
    sem.create(0).unwrap();

    let slot: Arc<OnceCell<Thread>> = Arc::new(OnceCell::new());
    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let me = Arc::clone(&slot);
    let s = sem.clone();
    let zombie = Thread::new(&kernel, ThreadConfig::new("zombie"), move || {
        if let Some(handle) = me.get() {
            let _ = handle.terminate();
            // Execution continues past the terminate; services refuse it.
            *seen.lock() = Some(s.get(WaitOption::Forever));
        }
    });
    let _ = slot.set(zombie.clone());

    zombie.create_and_resume().unwrap();
    wait_for(|| outcome.lock().is_some());
    assert_eq!(*outcome.lock(), Some(Err(KernelError::Terminated)));
    assert_eq!(zombie.state(), Ok(ThreadState::Terminated));
    assert_eq!(sem.info().unwrap().waiting, 0);
}
