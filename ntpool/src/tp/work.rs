//! Work Items
//!
//! A [`WorkItem`] runs its callback once per `post`. The item can be
//! posted again as soon as its callback has started.
//!
//! Equivalent to NT's TP_WORK.
//!
//! # Usage
//! ```
//! use ntpool::tp::WorkItem;
//!
//! let item = WorkItem::new(|instance| {
//!     let _ = instance.wait_duration();
//! });
//! item.post();
//! item.join();
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use super::environment::CallbackEnvironment;
use super::instance::CallbackInstance;
use super::object::{CallbackTarget, DispatchContext, Payload, TpObject, TpObjectKind};
use super::work_item::{WorkItemBase, WorkItemControl, WorkItemProfile, WorkItemState};
use crate::ex::rundown::Join;
use crate::ke::bugcheck::codes;
use crate::ke::thread::ThreadId;
use crate::{bugcheck, bugcheck_if};

type WorkCallback = Box<dyn Fn(&CallbackInstance<'_>) + Send + Sync + 'static>;

/// One-shot callback that can be posted repeatedly
pub struct WorkItem {
    base: WorkItemBase,
    object: Arc<TpObject>,
    callback: WorkCallback,
}

impl WorkItem {
    /// Work item on the system pool
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        Self::new_in(&CallbackEnvironment::new(), callback)
    }

    /// Work item bound to `environment`
    pub fn new_in<F>(environment: &CallbackEnvironment, callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let id = TpObject::allocate_id();
        Arc::new_cyclic(|this: &Weak<WorkItem>| {
            let target: Weak<dyn CallbackTarget> = this.clone();
            Self {
                base: WorkItemBase::new(id),
                object: TpObject::new(id, TpObjectKind::Work, environment, target),
                callback: Box::new(callback),
            }
        })
    }

    /// Queue one run of the callback
    ///
    /// The item must be Ready: posting a Posted or Closed item is a
    /// contract violation.
    pub fn post(self: &Arc<Self>) {
        bugcheck_if!(
            self.object.is_closed(),
            codes::INVALID_WORK_ITEM_STATE,
            self.base.id(),
            WorkItemState::Closed as u8,
            WorkItemState::Posted as u8
        );
        self.base.move_to_posted(self.clone());
        self.object.queue(Payload::Work);
    }

    /// Wait for queued and running callbacks to finish
    pub fn join(&self) {
        self.base.check_not_self_join();
        if !self.is_closed() {
            self.object.wait_for_callbacks(false);
            self.base.join_complete();
        }
    }

    /// Drop callbacks that have not started, wait for running ones
    pub fn try_cancel_and_join(&self) {
        self.base.check_not_self_join();
        if !self.is_closed() {
            self.object.wait_for_callbacks(true);
            self.base.join_complete();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    pub fn is_posted(&self) -> bool {
        self.base.is_posted()
    }

    pub fn state(&self) -> WorkItemState {
        self.base.state()
    }

    pub fn is_current_thread_executing_callback(&self) -> bool {
        self.base.callback_thread().is_current_thread()
    }

    pub fn worker_thread_id(&self) -> ThreadId {
        self.base.worker_thread_id()
    }

    pub fn profile(&self) -> &WorkItemProfile {
        self.base.profile()
    }

    pub fn wait_duration(&self) -> Duration {
        self.base.profile().wait_duration()
    }

    pub fn run_duration(&self) -> Duration {
        self.base.profile().run_duration()
    }

    pub fn duration(&self) -> Duration {
        self.base.profile().duration()
    }
}

impl CallbackTarget for WorkItem {
    fn run(&self, context: &DispatchContext<'_>, payload: Payload) {
        if !matches!(payload, Payload::Work) {
            bugcheck!(codes::INVALID_WORK_QUEUE_ITEM, self.base.id());
        }

        let this = self.base.start_running();
        bugcheck_if!(
            this.is_none(),
            codes::INVALID_WORK_ITEM_STATE,
            self.base.id(),
            self.base.state() as u8,
            WorkItemState::Ready as u8
        );

        let instance = CallbackInstance::new(context, Some(self.base.profile()));
        {
            let _scope = self.base.callback_thread().enter();
            (self.callback)(&instance);
            self.base.complete_running();
        }
        instance.complete();
        drop(this);
    }

    fn on_closed(&self) {
        drop(self.base.move_to_closed());
    }
}

impl Join for WorkItem {
    fn join(&self) {
        WorkItem::join(self)
    }
}

impl WorkItemControl for WorkItem {
    fn try_cancel_and_join(&self) {
        WorkItem::try_cancel_and_join(self)
    }

    fn is_closed(&self) -> bool {
        WorkItem::is_closed(self)
    }

    fn worker_thread_id(&self) -> ThreadId {
        WorkItem::worker_thread_id(self)
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if !self.base.is_closed() {
            self.object.close();
        }
    }
}

impl core::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.base.id())
            .field("state", &self.base.state())
            .finish()
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type TP_WORK = WorkItem;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::event::KEvent;
    use crate::tp::pool::{ThreadPool, ThreadPoolConfig};
    use crate::tp::work_item::ScopedJoin;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn test_pool() -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig::default().with_threads(1, 4)).unwrap()
    }

    #[test]
    fn test_post_and_join() {
        let pool = test_pool();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let item = pool.make_work_item(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..10 {
            item.post();
            item.join();
            assert_eq!(item.state(), WorkItemState::Ready);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert!(item.profile().duration() >= item.profile().run_duration());
    }

    #[test]
    fn test_posted_item_outlives_handle() {
        let pool = test_pool();
        let done = Arc::new(KEvent::notification(false));

        let signal = done.clone();
        let item = pool.make_work_item(move |_| {
            signal.set();
        });
        let weak = Arc::downgrade(&item);
        item.post();
        drop(item);

        assert!(done.wait_timeout(std::time::Duration::from_secs(5)));
        // The posted-item table let go once the callback finished
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while weak.upgrade().is_some() && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_cancel_before_start() {
        let pool = ThreadPool::new(ThreadPoolConfig::default().with_threads(1, 1)).unwrap();
        let gate = Arc::new(KEvent::notification(false));
        let started = Arc::new(KEvent::notification(false));

        // Hold the only worker
        let (gate_wait, started_set) = (gate.clone(), started.clone());
        pool.submit_work(move |_| {
            started_set.set();
            gate_wait.wait();
        });
        assert!(started.wait_timeout(std::time::Duration::from_secs(5)));

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let item = pool.make_work_item(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        item.post();
        item.try_cancel_and_join();
        gate.set();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(item.state(), WorkItemState::Ready);

        // Reusable after a cancelled post
        item.post();
        item.join();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_thread_id_visible_in_callback() {
        let pool = test_pool();
        let observed = Arc::new(AtomicUsize::new(0));

        let slot = observed.clone();
        let item = pool.make_work_item(move |instance| {
            slot.store(instance.worker_thread_id() as usize, Ordering::SeqCst);
        });
        item.post();
        item.join();

        assert_ne!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(item.worker_thread_id(), 0);
        assert!(!item.is_current_thread_executing_callback());
    }

    #[test]
    fn test_scoped_join() {
        let pool = test_pool();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let item = pool.make_work_item(move |_| {
            std::thread::sleep(std::time::Duration::from_millis(10));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        {
            let _join = ScopedJoin::new(item.clone());
            item.post();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
