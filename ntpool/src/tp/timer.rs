//! Timer Work Items
//!
//! A [`TimerWorkItem`] runs its callback once when its due time arrives.
//! There are no periodic timers; a callback that wants to repeat
//! schedules its item again.
//!
//! Equivalent to NT's TP_TIMER.
//!
//! # Join Semantics
//!
//! `join` waits only for callbacks already queued or running: a timer
//! that has not fired yet stays armed and the item returns to Ready.
//! `try_cancel_and_join` disarms the timer first, so no callback runs
//! after it returns.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::environment::CallbackEnvironment;
use super::instance::CallbackInstance;
use super::object::{CallbackTarget, DispatchContext, Payload, TpObject, TpObjectKind};
use super::work_item::{WorkItemBase, WorkItemControl, WorkItemProfile, WorkItemState};
use crate::ex::rundown::Join;
use crate::ke::bugcheck::codes;
use crate::ke::thread::ThreadId;
use crate::{bugcheck, bugcheck_if};

/// Stand-in due time for delays too long to represent (about 100 years)
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Absolute due time `delay` from now, saturating at a far-future time
pub(crate) fn due_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

type TimerCallback = Box<dyn Fn(&CallbackInstance<'_>) + Send + Sync + 'static>;

/// One-shot timer callback
pub struct TimerWorkItem {
    base: WorkItemBase,
    object: Arc<TpObject>,
    callback: TimerCallback,
}

impl TimerWorkItem {
    /// Timer on the system pool
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        Self::new_in(&CallbackEnvironment::new(), callback)
    }

    /// Timer bound to `environment`
    pub fn new_in<F>(environment: &CallbackEnvironment, callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let id = TpObject::allocate_id();
        Arc::new_cyclic(|this: &Weak<TimerWorkItem>| {
            let target: Weak<dyn CallbackTarget> = this.clone();
            Self {
                base: WorkItemBase::new(id),
                object: TpObject::new(id, TpObjectKind::Timer, environment, target),
                callback: Box::new(callback),
            }
        })
    }

    /// Run the callback once `delay` has elapsed
    pub fn schedule(self: &Arc<Self>, delay: Duration) {
        self.schedule_at(due_after(delay));
    }

    /// Run the callback at `due` (immediately if already past)
    pub fn schedule_at(self: &Arc<Self>, due: Instant) {
        bugcheck_if!(
            self.object.is_closed(),
            codes::INVALID_WORK_ITEM_STATE,
            self.base.id(),
            WorkItemState::Closed as u8,
            WorkItemState::Posted as u8
        );
        self.base.move_to_posted(self.clone());
        self.object.set_timer(due);
    }

    /// Armed and not yet fired, cancelled or joined
    pub fn is_scheduled(&self) -> bool {
        self.object.is_timer_armed() && self.base.is_posted()
    }

    /// Wait for fired callbacks; an unfired timer stays armed
    pub fn join(&self) {
        self.base.check_not_self_join();
        if !self.is_closed() {
            self.object.wait_for_callbacks(false);
            self.base.join_complete();
        }
    }

    /// Disarm the timer and drop a fired callback that has not started,
    /// then wait for a running one
    pub fn try_cancel_and_join(&self) {
        self.base.check_not_self_join();
        if !self.is_closed() {
            self.object.cancel_timer();
            self.object.wait_for_callbacks(true);
            self.base.join_complete();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.base.is_closed()
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
}

impl CallbackTarget for TimerWorkItem {
    fn run(&self, context: &DispatchContext<'_>, payload: Payload) {
        if !matches!(payload, Payload::Timer) {
            bugcheck!(codes::INVALID_WORK_QUEUE_ITEM, self.base.id());
        }

        // None when a join already returned the item to Ready; the
        // callback still runs for the fired timer.
        let this = self.base.start_running();

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

impl Join for TimerWorkItem {
    fn join(&self) {
        TimerWorkItem::join(self)
    }
}

impl WorkItemControl for TimerWorkItem {
    fn try_cancel_and_join(&self) {
        TimerWorkItem::try_cancel_and_join(self)
    }

    fn is_closed(&self) -> bool {
        TimerWorkItem::is_closed(self)
    }

    fn worker_thread_id(&self) -> ThreadId {
        TimerWorkItem::worker_thread_id(self)
    }
}

impl Drop for TimerWorkItem {
    fn drop(&mut self) {
        if !self.base.is_closed() {
            self.object.close();
        }
    }
}

impl core::fmt::Debug for TimerWorkItem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerWorkItem")
            .field("id", &self.base.id())
            .field("state", &self.base.state())
            .field("armed", &self.object.is_timer_armed())
            .finish()
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type TP_TIMER = TimerWorkItem;
