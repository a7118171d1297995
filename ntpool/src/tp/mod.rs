//! Thread Pool
//!
//! Work, timer, wait and I/O items dispatched on a thread pool, with the
//! lifecycle guarantees the executive layer needs:
//!
//! - A posted item cannot be destroyed before its callback has started
//!   or the post has been cancelled
//! - `join` waits out queued and running callbacks; `try_cancel_and_join`
//!   first drops the ones that have not started
//! - Joining from inside the item's own callback is a bug check rather
//!   than a deadlock
//! - Cleanup groups close many items at once
//!
//! # Layout
//!
//! - [`pool`]: The dispatch facility (workers, priority queues, timers)
//! - [`environment`]: Pool, cleanup group and options for new objects
//! - [`instance`]: Per-callback context
//! - [`work_item`]: State machine shared by the item kinds
//! - [`work`], [`timer`], [`wait`], [`io`]: The item kinds
//! - [`cleanup`]: Cleanup groups
//!
//! The free functions below operate on [`ThreadPool::system`].

pub mod cleanup;
pub mod environment;
pub mod instance;
pub mod io;
mod object;
pub mod pool;
pub mod timer;
pub mod wait;
pub mod work;
pub mod work_item;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ke::event::KEvent;

pub use cleanup::{CleanupGroup, SafeCleanupGroup, SafeGroupGuard};
pub use environment::{CallbackEnvironment, CallbackFlags, CallbackOptions, CallbackPriority};
pub use instance::CallbackInstance;
pub use io::{IoCompletionPort, IoGuard, IoHandler};
pub use object::{IoCompletion, WaitResult};
pub use pool::{ThreadPool, ThreadPoolConfig};
pub use timer::TimerWorkItem;
pub use wait::WaitWorkItem;
pub use work::WorkItem;
pub use work_item::{posted_item_count, ScopedJoin, WorkItemControl, WorkItemProfile, WorkItemState};

/// Run `callback` once on the system pool, without a work item
pub fn submit_work<F>(callback: F)
where
    F: FnOnce(&CallbackInstance<'_>) + Send + 'static,
{
    ThreadPool::system().submit_work(callback);
}

/// Create a work item on the system pool and post it
pub fn post<F>(callback: F) -> Arc<WorkItem>
where
    F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
{
    ThreadPool::system().post(callback)
}

/// Create a timer on the system pool due after `delay`
pub fn schedule<F>(delay: Duration, callback: F) -> Arc<TimerWorkItem>
where
    F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
{
    ThreadPool::system().schedule(delay, callback)
}

/// Create a timer on the system pool due at `due`
pub fn schedule_at<F>(due: Instant, callback: F) -> Arc<TimerWorkItem>
where
    F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
{
    ThreadPool::system().schedule_at(due, callback)
}

/// Create a wait on the system pool for `event`
pub fn schedule_wait<F>(event: &Arc<KEvent>, timeout: Option<Duration>, callback: F) -> Arc<WaitWorkItem>
where
    F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
{
    ThreadPool::system().schedule_wait(event, timeout, callback)
}

pub fn make_work_item<F>(callback: F) -> Arc<WorkItem>
where
    F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
{
    ThreadPool::system().make_work_item(callback)
}

pub fn make_timer_work_item<F>(callback: F) -> Arc<TimerWorkItem>
where
    F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
{
    ThreadPool::system().make_timer_work_item(callback)
}

pub fn make_wait_work_item<F>(callback: F) -> Arc<WaitWorkItem>
where
    F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
{
    ThreadPool::system().make_wait_work_item(callback)
}

pub fn make_io_handler<F>(callback: F) -> Arc<IoHandler>
where
    F: Fn(&CallbackInstance<'_>, IoCompletion) + Send + Sync + 'static,
{
    ThreadPool::system().make_io_handler(callback)
}

pub fn make_cleanup_group() -> Arc<CleanupGroup> {
    ThreadPool::system().make_cleanup_group()
}
