//! Multi-threaded rundown scenarios

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ntpool::ex::{
    BlockingRundown, LightweightRundown, MasterPolicy, RundownCounter, RundownGuard,
};
use ntpool::Error;

#[test]
fn test_join_drains_fifty_users() {
    let rundown = Arc::new(BlockingRundown::new());
    let released = Arc::new(AtomicUsize::new(0));

    let users: Vec<_> = (0..50)
        .map(|_| {
            assert!(rundown.try_acquire());
            let (rundown, released) = (rundown.clone(), released.clone());
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                released.fetch_add(1, Ordering::SeqCst);
                rundown.release();
            })
        })
        .collect();

    rundown.join();
    assert_eq!(released.load(Ordering::SeqCst), 50);
    assert_eq!(rundown.count(Ordering::Acquire), 0);
    assert!(rundown.is_rundown_complete(Ordering::Acquire));

    for user in users {
        user.join().unwrap();
    }
}

#[test]
fn test_lightweight_join_has_no_lost_wakeups() {
    for users in [0usize, 1, 2, 7, 32] {
        let rundown = Arc::new(LightweightRundown::new());
        let released = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..users)
            .map(|index| {
                assert!(rundown.try_acquire());
                let (rundown, released) = (rundown.clone(), released.clone());
                thread::spawn(move || {
                    if index % 2 == 0 {
                        thread::yield_now();
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                    released.fetch_add(1, Ordering::SeqCst);
                    rundown.release();
                })
            })
            .collect();

        rundown.join();
        assert_eq!(released.load(Ordering::SeqCst), users);
        assert_eq!(rundown.count(Ordering::Acquire), 0);

        for thread in threads {
            thread.join().unwrap();
        }
    }
}

#[test]
fn test_overflow_boundary_under_contention() {
    const MAX: u64 = 16;
    let rundown = Arc::new(RundownCounter::new());
    let start = Arc::new(AtomicBool::new(false));

    let contenders: Vec<_> = (0..32)
        .map(|_| {
            let (rundown, start) = (rundown.clone(), start.clone());
            thread::spawn(move || {
                while !start.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                rundown.acquire_bounded(MAX)
            })
        })
        .collect();
    start.store(true, Ordering::Release);

    let mut acquired = 0;
    let mut overflowed = 0;
    for contender in contenders {
        match contender.join().unwrap() {
            Ok(()) => acquired += 1,
            Err(Error::CounterOverflow) => overflowed += 1,
            Err(error) => panic!("unexpected error: {error}"),
        }
    }

    assert_eq!(acquired, MAX);
    assert_eq!(overflowed, 32 - MAX);
    assert_eq!(rundown.count(Ordering::Acquire), MAX);

    for _ in 0..MAX {
        rundown.release();
    }
    assert!(rundown.start_rundown());
}

#[test]
fn test_cancel_then_acquire_always_fails() {
    let rundown = Arc::new(RundownCounter::new());
    assert!(rundown.try_acquire());
    assert!(!rundown.start_rundown());
    assert!(rundown.is_running_down(Ordering::Acquire));

    let refusals: Vec<_> = (0..8)
        .map(|_| {
            let rundown = rundown.clone();
            thread::spawn(move || {
                (0..1000).all(|_| {
                    !rundown.try_acquire() && matches!(rundown.acquire(), Err(Error::RundownActive))
                })
            })
        })
        .collect();

    for refusal in refusals {
        assert!(refusal.join().unwrap());
    }

    rundown.release();
    assert!(rundown.is_rundown_complete(Ordering::Acquire));
    assert!(!rundown.try_acquire());
}

#[test]
fn test_restart_cycle() {
    let rundown = Arc::new(BlockingRundown::new());

    for _ in 0..5 {
        assert!(rundown.try_acquire());
        let user = {
            let rundown = rundown.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                rundown.release();
            })
        };

        rundown.join();
        assert!(rundown.is_rundown_complete(Ordering::Acquire));
        user.join().unwrap();

        let outcome = rundown.restart();
        assert!(outcome.accepted);
        assert!(outcome.was_idle);
        assert!(rundown.is_running(Ordering::Acquire));
        assert!(!rundown.completion_event().is_signaled());
    }
}

#[test]
fn test_guards_across_threads() {
    let rundown = Arc::new(LightweightRundown::new());

    let guards: Vec<_> = (0..4)
        .map(|_| {
            let guard = RundownGuard::new(rundown.clone()).unwrap();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                drop(guard);
            })
        })
        .collect();

    rundown.join();
    assert!(RundownGuard::try_new(rundown.clone()).is_none());
    for guard in guards {
        guard.join().unwrap();
    }
}

#[test]
fn test_master_rundown_waits_for_children() {
    let master = Arc::new(BlockingRundown::new());
    let children: Vec<_> = (0..3)
        .map(|_| Arc::new(RundownCounter::with_policy(MasterPolicy::new(master.clone()))))
        .collect();
    assert_eq!(master.count(Ordering::Acquire), 3);

    let joiner = {
        let master = master.clone();
        thread::spawn(move || master.join())
    };
    thread::sleep(Duration::from_millis(10));
    assert!(master.is_running_down(Ordering::Acquire));

    for child in &children {
        assert!(child.start_rundown());
    }
    joiner.join().unwrap();
    assert!(master.is_rundown_complete(Ordering::Acquire));

    // A master that ran down refuses to restart its children
    let outcome = children[0].restart();
    assert!(!outcome.accepted);
    assert!(outcome.was_idle);
}
