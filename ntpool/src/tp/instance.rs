//! Callback Instance
//!
//! Handed to every callback the pool runs. Gives the callback access to
//! its dispatch timing, lets it ask for a spare worker before blocking,
//! and queues actions the pool performs once the callback has returned.
//!
//! Equivalent to NT's PTP_CALLBACK_INSTANCE.
//!
//! # On-Return Actions
//!
//! Actions run in registration order after the callback returns and
//! before the pool counts the callback as finished, so a thread waiting
//! on the event (or semaphore, or rundown) observes the callback's
//! effects.

use core::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::environment::CallbackOptions;
use super::object::DispatchContext;
use super::pool::PoolShared;
use super::work_item::WorkItemProfile;
use crate::ex::rundown::Rundown;
use crate::ke::event::KEvent;
use crate::ke::semaphore::KSemaphore;
use crate::ke::thread::{ke_get_current_thread_id, ThreadId};

/// Deferred action performed when the callback returns
enum OnReturn {
    SetEvent(Arc<KEvent>),
    ReleaseSemaphore(Arc<KSemaphore>, i32),
    ReleaseRundown(Arc<dyn Rundown + Send + Sync>),
}

/// Per-dispatch view of a running callback
pub struct CallbackInstance<'a> {
    pool: &'a Arc<PoolShared>,
    options: CallbackOptions,
    queued_at: Instant,
    started_at: Instant,
    worker_thread_id: ThreadId,
    profile: Option<&'a WorkItemProfile>,
    on_return: RefCell<Vec<OnReturn>>,
}

impl<'a> CallbackInstance<'a> {
    pub(crate) fn new(
        context: &DispatchContext<'a>,
        profile: Option<&'a WorkItemProfile>,
    ) -> Self {
        Self {
            pool: context.pool,
            options: context.options,
            queued_at: context.queued_at,
            started_at: context.started_at,
            worker_thread_id: ke_get_current_thread_id(),
            profile,
            on_return: RefCell::new(Vec::new()),
        }
    }

    /// Options of the object this callback belongs to
    pub fn options(&self) -> CallbackOptions {
        self.options
    }

    /// Worker thread running the callback
    pub fn worker_thread_id(&self) -> ThreadId {
        self.worker_thread_id
    }

    /// Tell the pool this callback may block for a long time
    ///
    /// Returns true if another worker is available (or could be started)
    /// to serve the rest of the queue meanwhile.
    pub fn may_run_long(&self) -> bool {
        self.pool.ensure_spare_worker()
    }

    /// Signal `event` after the callback returns
    pub fn set_event_on_callback_return(&self, event: Arc<KEvent>) {
        self.on_return.borrow_mut().push(OnReturn::SetEvent(event));
    }

    /// Release `semaphore` by `count` after the callback returns
    pub fn release_semaphore_on_callback_return(&self, semaphore: Arc<KSemaphore>, count: i32) {
        self.on_return
            .borrow_mut()
            .push(OnReturn::ReleaseSemaphore(semaphore, count));
    }

    /// Release one reference on `rundown` after the callback returns
    pub fn release_rundown_on_callback_return(&self, rundown: Arc<dyn Rundown + Send + Sync>) {
        self.on_return
            .borrow_mut()
            .push(OnReturn::ReleaseRundown(rundown));
    }

    /// Time the callback waited for a worker
    ///
    /// For work items this covers the whole posted period; for plain
    /// submissions only the time in the queue.
    pub fn wait_duration(&self) -> Duration {
        match self.profile {
            Some(profile) => profile.wait_duration(),
            None => self.started_at.saturating_duration_since(self.queued_at),
        }
    }

    /// Time spent in the callback so far
    pub fn run_duration(&self) -> Duration {
        match self.profile {
            Some(profile) => profile.run_duration(),
            None => self.started_at.elapsed(),
        }
    }

    /// Wait plus run time so far
    pub fn duration(&self) -> Duration {
        match self.profile {
            Some(profile) => profile.duration(),
            None => self.queued_at.elapsed(),
        }
    }

    /// Run the deferred actions; called once the callback has returned
    pub(crate) fn complete(self) {
        for action in self.on_return.into_inner() {
            match action {
                OnReturn::SetEvent(event) => {
                    event.set();
                }
                OnReturn::ReleaseSemaphore(semaphore, count) => {
                    if semaphore.release(count).is_none() {
                        log::warn!(
                            "callback-return release of {} would exceed semaphore limit {}",
                            count,
                            semaphore.limit()
                        );
                    }
                }
                OnReturn::ReleaseRundown(rundown) => rundown.release(),
            }
        }
    }
}

impl core::fmt::Debug for CallbackInstance<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackInstance")
            .field("options", &self.options)
            .field("worker_thread_id", &self.worker_thread_id)
            .field("pending_actions", &self.on_return.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ex::rundown_wait::LightweightRundown;
    use crate::tp::pool::{ThreadPool, ThreadPoolConfig};
    use core::sync::atomic::Ordering;

    const QUEUED_FOR: Duration = Duration::from_millis(5);

    fn with_instance(test: impl FnOnce(CallbackInstance<'_>)) {
        let pool = ThreadPool::new(ThreadPoolConfig::default()).unwrap();
        let started_at = Instant::now();
        let queued_at = started_at.checked_sub(QUEUED_FOR).unwrap_or(started_at);
        let context = DispatchContext {
            pool: pool.shared(),
            object_id: 0,
            options: CallbackOptions::new(),
            queued_at,
            started_at,
        };
        test(CallbackInstance::new(&context, None));
    }

    #[test]
    fn test_on_return_actions_run_at_completion() {
        let event = Arc::new(KEvent::notification(false));
        let semaphore = Arc::new(KSemaphore::new(0, 10));
        let rundown = Arc::new(LightweightRundown::new());
        assert!(rundown.try_acquire());

        with_instance(|instance| {
            instance.set_event_on_callback_return(event.clone());
            instance.release_semaphore_on_callback_return(semaphore.clone(), 3);
            instance.release_rundown_on_callback_return(rundown.clone());

            assert!(!event.is_signaled());
            assert_eq!(semaphore.count(), 0);
            instance.complete();
        });

        assert!(event.is_signaled());
        assert_eq!(semaphore.count(), 3);
        assert_eq!(rundown.count(Ordering::Acquire), 0);
    }

    #[test]
    fn test_durations_without_profile() {
        with_instance(|instance| {
            assert!(instance.wait_duration() <= QUEUED_FOR);

            // Each query reads the clock, so take the inner span first
            let run = instance.run_duration();
            let total = instance.duration();
            assert!(total >= run);
            assert!(total >= run + instance.wait_duration());
            assert_eq!(instance.worker_thread_id(), ke_get_current_thread_id());
        });
    }
}
