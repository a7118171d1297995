//! Wait Work Items
//!
//! A [`WaitWorkItem`] runs its callback once when an event is signaled
//! or, if a timeout was given, when the timeout elapses first. The
//! callback learns which of the two happened through [`WaitResult`].
//!
//! Waiting on a synchronization event consumes the signal, exactly as a
//! waiting thread would.
//!
//! Equivalent to NT's TP_WAIT.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::environment::CallbackEnvironment;
use super::instance::CallbackInstance;
use super::object::{CallbackTarget, DispatchContext, Payload, TpObject, TpObjectKind, WaitResult};
use super::timer::due_after;
use super::work_item::{WorkItemBase, WorkItemControl, WorkItemProfile, WorkItemState};
use crate::ex::rundown::Join;
use crate::ke::bugcheck::codes;
use crate::ke::event::KEvent;
use crate::ke::thread::ThreadId;
use crate::{bugcheck, bugcheck_if};

type WaitCallback = Box<dyn Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static>;

/// Callback triggered by an event
pub struct WaitWorkItem {
    base: WorkItemBase,
    object: Arc<TpObject>,
    callback: WaitCallback,
}

impl WaitWorkItem {
    /// Wait item on the system pool
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        Self::new_in(&CallbackEnvironment::new(), callback)
    }

    /// Wait item bound to `environment`
    pub fn new_in<F>(environment: &CallbackEnvironment, callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        let id = TpObject::allocate_id();
        Arc::new_cyclic(|this: &Weak<WaitWorkItem>| {
            let target: Weak<dyn CallbackTarget> = this.clone();
            Self {
                base: WorkItemBase::new(id),
                object: TpObject::new(id, TpObjectKind::Wait, environment, target),
                callback: Box::new(callback),
            }
        })
    }

    /// Wait for `event`, giving up after `timeout` (never, if `None`)
    pub fn schedule_wait(self: &Arc<Self>, event: &Arc<KEvent>, timeout: Option<Duration>) {
        self.arm(event, timeout.map(due_after));
    }

    /// Wait for `event`, giving up at `deadline`
    pub fn schedule_wait_until(self: &Arc<Self>, event: &Arc<KEvent>, deadline: Instant) {
        self.arm(event, Some(deadline));
    }

    fn arm(self: &Arc<Self>, event: &Arc<KEvent>, deadline: Option<Instant>) {
        bugcheck_if!(
            self.object.is_closed(),
            codes::INVALID_WORK_ITEM_STATE,
            self.base.id(),
            WorkItemState::Closed as u8,
            WorkItemState::Posted as u8
        );
        self.base.move_to_posted(self.clone());
        self.object.set_wait(event.clone(), deadline);
    }

    /// Still waiting for the event
    pub fn is_waiting(&self) -> bool {
        self.object.is_wait_pending() && self.base.is_posted()
    }

    /// Wait for a completed wait's callback; a pending wait stays armed
    pub fn join(&self) {
        self.base.check_not_self_join();
        if !self.is_closed() {
            self.object.wait_for_callbacks(false);
            self.base.join_complete();
        }
    }

    /// Withdraw a pending wait and drop a callback that has not started,
    /// then wait for a running one
    pub fn try_cancel_and_join(&self) {
        self.base.check_not_self_join();
        if !self.is_closed() {
            self.object.cancel_wait();
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

impl CallbackTarget for WaitWorkItem {
    fn run(&self, context: &DispatchContext<'_>, payload: Payload) {
        let result = match payload {
            Payload::Wait(result) => result,
            _ => bugcheck!(codes::INVALID_WORK_QUEUE_ITEM, self.base.id()),
        };

        let this = self.base.start_running();

        let instance = CallbackInstance::new(context, Some(self.base.profile()));
        {
            let _scope = self.base.callback_thread().enter();
            (self.callback)(&instance, result);
            self.base.complete_running();
        }
        instance.complete();
        drop(this);
    }

    fn on_closed(&self) {
        drop(self.base.move_to_closed());
    }
}

impl Join for WaitWorkItem {
    fn join(&self) {
        WaitWorkItem::join(self)
    }
}

impl WorkItemControl for WaitWorkItem {
    fn try_cancel_and_join(&self) {
        WaitWorkItem::try_cancel_and_join(self)
    }

    fn is_closed(&self) -> bool {
        WaitWorkItem::is_closed(self)
    }

    fn worker_thread_id(&self) -> ThreadId {
        WaitWorkItem::worker_thread_id(self)
    }
}

impl Drop for WaitWorkItem {
    fn drop(&mut self) {
        if !self.base.is_closed() {
            self.object.close();
        }
    }
}

impl core::fmt::Debug for WaitWorkItem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitWorkItem")
            .field("id", &self.base.id())
            .field("state", &self.base.state())
            .finish()
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type TP_WAIT = WaitWorkItem;
