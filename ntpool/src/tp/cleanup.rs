//! Cleanup Groups
//!
//! A [`CleanupGroup`] tracks every pool object created through its
//! environment so they can be joined or cancelled as a unit. Closing the
//! group closes each member: its pending timer or wait is disarmed, its
//! callbacks are waited out, and the item moves to Closed, giving back
//! its self-reference if it was still posted.
//!
//! Equivalent to NT's TP_CLEANUP_GROUP.
//!
//! # Serialization
//!
//! Adding members and closing the group must not overlap; a member added
//! while the group is being closed survives into the next round. Callers
//! that cannot guarantee this use [`SafeCleanupGroup`], which adds members
//! under a shared lock and swaps the group out under an exclusive one.
//!
//! # Usage
//! ```
//! use ntpool::tp::{self, SafeCleanupGroup};
//! use std::time::Duration;
//!
//! let group = SafeCleanupGroup::new(tp::ThreadPool::system().clone());
//! group.try_submit_work(|_| { /* ... */ });
//! let timer = group.try_schedule(Duration::from_secs(3600), |_| unreachable!());
//!
//! // Drop the timer that has not fired and wait for the work
//! group.try_cancel_and_join();
//! assert!(!group.is_valid());
//! assert!(timer.map_or(false, |timer| timer.is_closed()));
//! ```

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::environment::CallbackEnvironment;
use super::instance::CallbackInstance;
use super::io::{IoGuard, IoHandler};
use super::object::{IoCompletion, TpObject, WaitResult};
use super::pool::ThreadPool;
use super::timer::TimerWorkItem;
use super::wait::WaitWorkItem;
use super::work::WorkItem;
use crate::ex::rundown::Join;
use crate::ke::event::KEvent;

/// Next cleanup group id, for diagnostics
static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Cleanup Group
// ============================================================================

/// Joins or cancels its member objects as a unit
pub struct CleanupGroup {
    id: u64,
    pool: ThreadPool,
    members: spin::Mutex<BTreeMap<u64, Arc<TpObject>>>,
}

impl CleanupGroup {
    /// Create an empty group dispatching on `pool`
    pub fn new(pool: ThreadPool) -> Arc<Self> {
        let id = NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("cleanup group {} created on pool {}", id, pool.id());

        Arc::new(Self {
            id,
            pool,
            members: spin::Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Objects currently tracked
    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub(crate) fn add_member(&self, object: Arc<TpObject>) {
        self.members.lock().insert(object.id(), object);
    }

    /// Forget a member that closed on its own
    pub(crate) fn remove_member(&self, id: u64) {
        let removed = self.members.lock().remove(&id);
        // Released outside the member lock
        drop(removed);
    }

    /// Environment making new objects members of this group
    pub fn environment(self: &Arc<Self>) -> CallbackEnvironment {
        CallbackEnvironment::new()
            .with_pool(self.pool.clone())
            .with_cleanup_group(self.clone())
    }

    // ------------------------------------------------------------------------
    // Member Creation
    // ------------------------------------------------------------------------

    pub fn make_work_item<F>(self: &Arc<Self>, callback: F) -> Arc<WorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        WorkItem::new_in(&self.environment(), callback)
    }

    pub fn make_timer_work_item<F>(self: &Arc<Self>, callback: F) -> Arc<TimerWorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        TimerWorkItem::new_in(&self.environment(), callback)
    }

    pub fn make_wait_work_item<F>(self: &Arc<Self>, callback: F) -> Arc<WaitWorkItem>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        WaitWorkItem::new_in(&self.environment(), callback)
    }

    pub fn make_io_handler<F>(self: &Arc<Self>, callback: F) -> Arc<IoHandler>
    where
        F: Fn(&CallbackInstance<'_>, IoCompletion) + Send + Sync + 'static,
    {
        IoHandler::new_in(&self.environment(), callback)
    }

    /// Create a member work item and post it
    pub fn post<F>(self: &Arc<Self>, callback: F) -> Arc<WorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let item = self.make_work_item(callback);
        item.post();
        item
    }

    /// Run `callback` once through a member work item nobody holds
    ///
    /// The item stays a member until its callback has run or the group
    /// is closed.
    pub fn submit_work<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(&CallbackInstance<'_>) + Send + 'static,
    {
        let callback = spin::Mutex::new(Some(callback));
        self.post(move |instance| {
            if let Some(callback) = callback.lock().take() {
                callback(instance);
            }
        });
    }

    /// Create a member timer due after `delay`
    pub fn schedule<F>(self: &Arc<Self>, delay: Duration, callback: F) -> Arc<TimerWorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let timer = self.make_timer_work_item(callback);
        timer.schedule(delay);
        timer
    }

    /// Create a member timer due at `due`
    pub fn schedule_at<F>(self: &Arc<Self>, due: Instant, callback: F) -> Arc<TimerWorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let timer = self.make_timer_work_item(callback);
        timer.schedule_at(due);
        timer
    }

    /// Create a member wait on `event`
    pub fn schedule_wait<F>(
        self: &Arc<Self>,
        event: &Arc<KEvent>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Arc<WaitWorkItem>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        let wait = self.make_wait_work_item(callback);
        wait.schedule_wait(event, timeout);
        wait
    }

    // ------------------------------------------------------------------------
    // Closure
    // ------------------------------------------------------------------------

    /// Close every member, waiting for queued and running callbacks
    ///
    /// Timers and waits that have not fired are disarmed; they would
    /// otherwise keep the group open indefinitely.
    pub fn join(&self) {
        self.close_members(false);
    }

    /// Close every member, dropping callbacks that have not started and
    /// waiting for running ones
    pub fn try_cancel_and_join(&self) {
        self.close_members(true);
    }

    fn close_members(&self, cancel_pending: bool) {
        let members = core::mem::take(&mut *self.members.lock());
        if members.is_empty() {
            return;
        }

        log::debug!(
            "cleanup group {}: {} {} members",
            self.id,
            if cancel_pending { "cancelling" } else { "joining" },
            members.len()
        );

        // Stop everything from arming again before waiting on any of it
        for object in members.values() {
            if cancel_pending {
                object.cancel_pending();
            } else {
                object.disarm();
            }
        }

        for object in members.values() {
            object.wait_for_callbacks(cancel_pending);
            object.close_from_group();
            if let Some(target) = object.target() {
                log::trace!("cleanup group {}: closing {:?} {}", self.id, object.kind(), object.id());
                target.on_closed();
            }
        }
    }
}

impl Join for CleanupGroup {
    fn join(&self) {
        CleanupGroup::join(self)
    }
}

impl Drop for CleanupGroup {
    fn drop(&mut self) {
        self.try_cancel_and_join();
    }
}

impl core::fmt::Debug for CleanupGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CleanupGroup")
            .field("id", &self.id)
            .field("pool", &self.pool.id())
            .field("members", &self.member_count())
            .finish()
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type TP_CLEANUP_GROUP = CleanupGroup;

// ============================================================================
// Safe Cleanup Group
// ============================================================================

/// Cleanup group that serializes member creation against closure
///
/// Member creation and posting run under a shared lock and fail once
/// the group has been joined; `join`, `try_cancel_and_join` and
/// `reinitialize` take the group out under the exclusive lock and close
/// it after the lock is released.
pub struct SafeCleanupGroup {
    pool: ThreadPool,
    group: spin::RwLock<Option<Arc<CleanupGroup>>>,
}

/// Holds a [`SafeCleanupGroup`] open
///
/// While the guard lives, the group cannot be joined or reinitialized,
/// so members can be created and posted through [`SafeGroupGuard::group`].
pub struct SafeGroupGuard<'a> {
    group: Arc<CleanupGroup>,
    _shared: spin::RwLockReadGuard<'a, Option<Arc<CleanupGroup>>>,
}

impl SafeGroupGuard<'_> {
    pub fn group(&self) -> &Arc<CleanupGroup> {
        &self.group
    }
}

impl SafeCleanupGroup {
    /// A live group on `pool`
    pub fn new(pool: ThreadPool) -> Self {
        let group = CleanupGroup::new(pool.clone());
        Self {
            pool,
            group: spin::RwLock::new(Some(group)),
        }
    }

    /// Replace the group with a fresh one, joining the old one if any
    pub fn reinitialize(&self) {
        let fresh = CleanupGroup::new(self.pool.clone());
        let old = self.group.write().replace(fresh);
        if let Some(old) = old {
            old.join();
        }
    }

    /// Join and retire the group; every `try_*` fails until `reinitialize`
    pub fn join(&self) {
        let old = self.group.write().take();
        if let Some(old) = old {
            old.join();
        }
    }

    /// Cancel, join and retire the group
    pub fn try_cancel_and_join(&self) {
        let old = self.group.write().take();
        if let Some(old) = old {
            old.try_cancel_and_join();
        }
    }

    pub fn is_valid(&self) -> bool {
        self.group.read().is_some()
    }

    /// The current group, if live
    pub fn try_get_cleanup_group(&self) -> Option<Arc<CleanupGroup>> {
        self.group.read().clone()
    }

    /// Hold the group open for a batch of operations
    pub fn try_acquire(&self) -> Option<SafeGroupGuard<'_>> {
        let shared = self.group.read();
        let group = shared.clone()?;
        Some(SafeGroupGuard {
            group,
            _shared: shared,
        })
    }

    fn with_group<R>(&self, f: impl FnOnce(&Arc<CleanupGroup>) -> R) -> Option<R> {
        self.try_acquire().map(|guard| f(guard.group()))
    }

    // ------------------------------------------------------------------------
    // Member Creation
    // ------------------------------------------------------------------------

    pub fn try_make_work_item<F>(&self, callback: F) -> Option<Arc<WorkItem>>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        self.with_group(|group| group.make_work_item(callback))
    }

    pub fn try_make_timer_work_item<F>(&self, callback: F) -> Option<Arc<TimerWorkItem>>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        self.with_group(|group| group.make_timer_work_item(callback))
    }

    pub fn try_make_wait_work_item<F>(&self, callback: F) -> Option<Arc<WaitWorkItem>>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        self.with_group(|group| group.make_wait_work_item(callback))
    }

    pub fn try_make_io_handler<F>(&self, callback: F) -> Option<Arc<IoHandler>>
    where
        F: Fn(&CallbackInstance<'_>, IoCompletion) + Send + Sync + 'static,
    {
        self.with_group(|group| group.make_io_handler(callback))
    }

    // ------------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------------

    /// Create a member work item and post it
    pub fn try_post<F>(&self, callback: F) -> Option<Arc<WorkItem>>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        self.with_group(|group| group.post(callback))
    }

    /// Post an existing member
    pub fn try_post_item(&self, item: &Arc<WorkItem>) -> bool {
        self.with_group(|_| item.post()).is_some()
    }

    pub fn try_submit_work<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&CallbackInstance<'_>) + Send + 'static,
    {
        self.with_group(|group| group.submit_work(callback)).is_some()
    }

    pub fn try_schedule<F>(&self, delay: Duration, callback: F) -> Option<Arc<TimerWorkItem>>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        self.with_group(|group| group.schedule(delay, callback))
    }

    pub fn try_schedule_at<F>(&self, due: Instant, callback: F) -> Option<Arc<TimerWorkItem>>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        self.with_group(|group| group.schedule_at(due, callback))
    }

    /// Arm an existing member timer
    pub fn try_schedule_item(&self, timer: &Arc<TimerWorkItem>, delay: Duration) -> bool {
        self.with_group(|_| timer.schedule(delay)).is_some()
    }

    pub fn try_schedule_wait<F>(
        &self,
        event: &Arc<KEvent>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Option<Arc<WaitWorkItem>>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        self.with_group(|group| group.schedule_wait(event, timeout, callback))
    }

    /// Arm an existing member wait
    pub fn try_schedule_wait_item(
        &self,
        wait: &Arc<WaitWorkItem>,
        event: &Arc<KEvent>,
        timeout: Option<Duration>,
    ) -> bool {
        self.with_group(|_| wait.schedule_wait(event, timeout)).is_some()
    }

    /// Start an I/O on a member handler
    pub fn try_start_io<'a>(&self, handler: &'a IoHandler) -> Option<IoGuard<'a>> {
        self.with_group(|_| handler.start_io())
    }
}

impl Default for SafeCleanupGroup {
    /// A live group on the system pool
    fn default() -> Self {
        Self::new(ThreadPool::system().clone())
    }
}

impl Join for SafeCleanupGroup {
    fn join(&self) {
        SafeCleanupGroup::join(self)
    }
}

impl Drop for SafeCleanupGroup {
    fn drop(&mut self) {
        self.try_cancel_and_join();
    }
}

impl core::fmt::Debug for SafeCleanupGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SafeCleanupGroup")
            .field("pool", &self.pool.id())
            .field("group", &*self.group.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tp::pool::ThreadPoolConfig;
    use crate::tp::work_item::WorkItemState;
    use core::sync::atomic::AtomicUsize;

    fn test_pool() -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig::default().with_threads(1, 4)).unwrap()
    }

    #[test]
    fn test_join_waits_for_members() {
        let pool = test_pool();
        let group = pool.make_cleanup_group();
        let runs = Arc::new(AtomicUsize::new(0));

        let items: Vec<_> = (0..8)
            .map(|_| {
                let counter = runs.clone();
                group.post(move |_| {
                    std::thread::sleep(Duration::from_millis(5));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert_eq!(group.member_count(), 8);

        group.join();
        assert_eq!(runs.load(Ordering::SeqCst), 8);
        assert_eq!(group.member_count(), 0);
        for item in &items {
            assert!(item.is_closed());
            assert_eq!(item.state(), WorkItemState::Closed);
        }
    }

    #[test]
    fn test_cancel_drops_unfired_timers() {
        let pool = test_pool();
        let group = pool.make_cleanup_group();
        let runs = Arc::new(AtomicUsize::new(0));

        let timers: Vec<_> = (0..4)
            .map(|_| {
                let counter = runs.clone();
                group.schedule(Duration::from_secs(3600), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert_eq!(pool.pending_timer_count(), 4);

        group.try_cancel_and_join();
        assert_eq!(pool.pending_timer_count(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        for timer in &timers {
            assert!(timer.is_closed());
            assert!(!timer.is_scheduled());
        }
    }

    #[test]
    fn test_member_closed_alone_leaves_group() {
        let pool = test_pool();
        let group = pool.make_cleanup_group();

        let item = group.make_work_item(|_| {});
        assert_eq!(group.member_count(), 1);
        drop(item);
        assert_eq!(group.member_count(), 0);
    }

    #[test]
    fn test_group_reusable_after_join() {
        let pool = test_pool();
        let group = pool.make_cleanup_group();
        let runs = Arc::new(AtomicUsize::new(0));

        for round in 1..=3 {
            let counter = runs.clone();
            group.submit_work(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            group.join();
            assert_eq!(runs.load(Ordering::SeqCst), round);
        }
    }

    #[test]
    fn test_safe_group_refuses_after_join() {
        let pool = test_pool();
        let group = SafeCleanupGroup::new(pool);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        assert!(group.try_submit_work(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        group.join();
        assert!(!group.is_valid());
        assert!(group.try_get_cleanup_group().is_none());
        assert!(group.try_acquire().is_none());
        assert!(group.try_post(|_| {}).is_none());
        assert!(!group.try_submit_work(|_| {}));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        group.reinitialize();
        assert!(group.is_valid());
        assert!(group.try_post(|_| {}).is_some());
    }

    #[test]
    fn test_safe_group_guard_holds_group_open() {
        let pool = test_pool();
        let group = SafeCleanupGroup::new(pool);

        let guard = group.try_acquire().unwrap();
        let item = guard.group().make_work_item(|_| {});
        assert_eq!(guard.group().member_count(), 1);
        drop(guard);

        assert!(group.try_post_item(&item));
        group.try_cancel_and_join();
        assert!(item.is_closed());
        assert!(!group.try_post_item(&item));
    }

    #[test]
    fn test_safe_group_start_io() {
        let pool = test_pool();
        let group = SafeCleanupGroup::new(pool);
        let handler = group.try_make_io_handler(|_, _| {}).unwrap();

        {
            let guard = group.try_start_io(&handler).unwrap();
            assert!(guard.is_armed());
            assert_eq!(handler.pending_io_count(), 1);
        }
        assert_eq!(handler.pending_io_count(), 0);

        group.join();
        assert!(handler.is_closed());
        assert!(group.try_start_io(&handler).is_none());
    }
}
