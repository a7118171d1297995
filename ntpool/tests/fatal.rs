//! Contract violations end the process with a bug check
//!
//! Each test re-runs itself in a child process with `NTPOOL_FATAL_CHILD`
//! set; the child commits the violation and the parent checks that it
//! died with the expected STOP code on stderr.

use std::process::Command;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use ntpool::ex::RundownCounter;
use ntpool::ke::KEvent;
use ntpool::tp::{IoHandler, ThreadPool, ThreadPoolConfig, TimerWorkItem, WorkItem};

const CHILD_MARKER: &str = "NTPOOL_FATAL_CHILD";

/// Run `violation` in a child process and expect bug check `stop_name`
fn expect_bugcheck(test_name: &str, stop_name: &str, violation: impl FnOnce()) {
    if std::env::var_os(CHILD_MARKER).is_some() {
        violation();
        // Reaching here means the violation went unnoticed
        std::process::exit(0);
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_MARKER, "1")
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "{test_name}: child exited normally\nstderr:\n{stderr}"
    );
    assert!(
        stderr.contains(stop_name),
        "{test_name}: expected {stop_name} on stderr\nstderr:\n{stderr}"
    );
}

fn single_worker_pool() -> ThreadPool {
    ThreadPool::new(ThreadPoolConfig::default().with_threads(1, 1)).unwrap()
}

#[test]
fn fatal_release_without_acquire() {
    expect_bugcheck("fatal_release_without_acquire", "RUNDOWN_COUNT_UNDERFLOW", || {
        let rundown = RundownCounter::new();
        rundown.release();
    });
}

#[test]
fn fatal_drop_while_acquired() {
    expect_bugcheck("fatal_drop_while_acquired", "RUNDOWN_NOT_COMPLETE", || {
        let rundown = RundownCounter::new();
        assert!(rundown.try_acquire());
        drop(rundown);
    });
}

#[test]
fn fatal_restart_while_running_down() {
    expect_bugcheck("fatal_restart_while_running_down", "INVALID_RUNDOWN_RESTART", || {
        let rundown = RundownCounter::new();
        assert!(rundown.try_acquire());
        rundown.start_rundown();
        let _ = rundown.restart();
    });
}

#[test]
fn fatal_self_join_from_callback() {
    expect_bugcheck("fatal_self_join_from_callback", "WORK_ITEM_SELF_JOIN", || {
        let pool = single_worker_pool();
        let this: Arc<OnceLock<Weak<WorkItem>>> = Arc::new(OnceLock::new());

        let slot = this.clone();
        let item = pool.make_work_item(move |_| {
            if let Some(item) = slot.get().and_then(Weak::upgrade) {
                item.try_cancel_and_join();
            }
        });
        let _ = this.set(Arc::downgrade(&item));

        item.post();
        item.join();
    });
}

#[test]
fn fatal_timer_self_join_from_callback() {
    expect_bugcheck("fatal_timer_self_join_from_callback", "WORK_ITEM_SELF_JOIN", || {
        let pool = single_worker_pool();
        let this: Arc<OnceLock<Weak<TimerWorkItem>>> = Arc::new(OnceLock::new());

        let slot = this.clone();
        let timer = pool.make_timer_work_item(move |_| {
            if let Some(timer) = slot.get().and_then(Weak::upgrade) {
                timer.join();
            }
        });
        let _ = this.set(Arc::downgrade(&timer));

        timer.schedule(Duration::from_millis(1));
        std::thread::sleep(Duration::from_secs(5));
    });
}

#[test]
fn fatal_io_self_join_from_callback() {
    expect_bugcheck("fatal_io_self_join_from_callback", "WORK_ITEM_SELF_JOIN", || {
        let pool = single_worker_pool();
        let this: Arc<OnceLock<Weak<IoHandler>>> = Arc::new(OnceLock::new());

        let slot = this.clone();
        let handler = pool.make_io_handler(move |_, _| {
            if let Some(handler) = slot.get().and_then(Weak::upgrade) {
                handler.join();
            }
        });
        let _ = this.set(Arc::downgrade(&handler));

        let mut guard = handler.start_io();
        guard.disarm();
        handler.port().complete(Box::new(()), 0, 0);
        std::thread::sleep(Duration::from_secs(5));
    });
}

#[test]
fn fatal_double_post() {
    expect_bugcheck("fatal_double_post", "INVALID_WORK_ITEM_STATE", || {
        let pool = single_worker_pool();
        let gate = Arc::new(KEvent::notification(false));

        // Keep the only worker busy so the first post stays queued
        let blocker = gate.clone();
        pool.submit_work(move |_| blocker.wait());

        let item = pool.make_work_item(|_| {});
        item.post();
        item.post();
    });
}

#[test]
fn fatal_panicking_callback() {
    expect_bugcheck("fatal_panicking_callback", "CALLBACK_RAISED_EXCEPTION", || {
        let pool = single_worker_pool();
        pool.submit_work(|_| panic!("callback failed"));
        std::thread::sleep(Duration::from_secs(5));
    });
}

#[test]
fn fatal_io_on_closed_handler() {
    expect_bugcheck("fatal_io_on_closed_handler", "IO_HANDLER_CLOSED", || {
        let pool = single_worker_pool();
        let group = pool.make_cleanup_group();
        let handler = group.make_io_handler(|_, _| {});

        group.join();
        let _guard = handler.start_io();
    });
}
