//! Pool Objects
//!
//! A [`TpObject`] is the dispatch facility's side of a work item, timer,
//! wait or I/O handler (NT's TP_WORK / TP_TIMER / TP_WAIT / TP_IO). It
//! owns everything the pool needs to run callbacks:
//!
//! - the outstanding-callback count that `wait_for_callbacks` drains
//! - the armed timer generation
//! - the pending wait registration
//! - a weak link to the user-facing item, which runs the callback
//!
//! Queue entries and timer entries hold the object, never the item, so
//! dropping the last user handle of an item is always possible; the
//! item's own lifetime while posted is handled by the posted-item table.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Instant;

use super::cleanup::CleanupGroup;
use super::environment::{CallbackEnvironment, CallbackOptions};
use super::pool::{PoolShared, ThreadPool, TimerAction, TimerEntry};
use crate::ex::keyed_event::{wait_on_address, wake_by_address_all};
use crate::ke::bugcheck::codes;
use crate::ke::event::{EventWaitBlock, KEvent};
use crate::ke::thread::ke_get_current_thread_id;
use crate::bugcheck;

/// Next pool object id; 0 is never used
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Next timer key; 0 means disarmed
static NEXT_TIMER_KEY: AtomicU64 = AtomicU64::new(1);

/// Pool object kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpObjectKind {
    Work,
    Timer,
    Wait,
    Io,
}

/// How a wait completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The event was signaled
    Signaled,
    /// The timeout elapsed first
    TimedOut,
}

/// A completed I/O request delivered to an I/O handler's callback
pub struct IoCompletion {
    /// The request the issuer attached when completing it
    pub request: Box<dyn Any + Send>,
    /// Completion status (0 is success)
    pub result: u32,
    /// Bytes transferred
    pub bytes_transferred: usize,
}

impl core::fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoCompletion")
            .field("result", &self.result)
            .field("bytes_transferred", &self.bytes_transferred)
            .finish_non_exhaustive()
    }
}

/// What a dispatched callback is about
pub(crate) enum Payload {
    Work,
    Timer,
    Wait(WaitResult),
    Io(IoCompletion),
}

/// Timing of one dispatch, handed to the item running the callback
pub(crate) struct DispatchContext<'a> {
    pub(crate) pool: &'a Arc<PoolShared>,
    pub(crate) object_id: u64,
    pub(crate) options: CallbackOptions,
    pub(crate) queued_at: Instant,
    pub(crate) started_at: Instant,
}

/// The user-facing side of a pool object
pub(crate) trait CallbackTarget: Send + Sync {
    /// Run the user callback for one dispatch
    fn run(&self, context: &DispatchContext<'_>, payload: Payload);

    /// The owning cleanup group closed this member
    fn on_closed(&self);
}

// ============================================================================
// Wait Registration
// ============================================================================

const WAIT_PENDING: u8 = 0;
const WAIT_COMPLETED: u8 = 1;

/// One scheduled wait of a wait object on an event
pub(crate) struct WaitRegistration {
    object: Weak<TpObject>,
    object_id: u64,
    /// Key of the timeout timer entry
    timer_key: u64,
    event: Arc<KEvent>,
    state: AtomicU8,
}

impl WaitRegistration {
    #[inline]
    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAIT_PENDING
    }

    /// Claim the registration; only one of signal, timeout or cancel wins
    fn claim(&self) -> bool {
        self.state
            .compare_exchange(WAIT_PENDING, WAIT_COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the registration with its callback already counted
    ///
    /// The count is taken before the claim, so nobody can observe the
    /// wait completed while its callback is not yet outstanding.
    fn claim_counted(&self, object: Option<&TpObject>) -> bool {
        if let Some(object) = object {
            object.outstanding.fetch_add(1, Ordering::AcqRel);
        }
        let claimed = self.claim();
        if !claimed {
            if let Some(object) = object {
                object.complete_callbacks(1);
            }
        }
        claimed
    }

    fn deliver(&self, object: Option<Arc<TpObject>>, result: WaitResult) {
        if let Some(object) = object {
            log::trace!("wait object {} completed: {:?}", self.object_id, result);
            object.queue_counted(Payload::Wait(result));
        }
    }

    /// The timeout elapsed
    pub(crate) fn time_out(self: &Arc<Self>) {
        let object = self.object.upgrade();
        if !self.claim_counted(object.as_deref()) {
            return;
        }
        let block: Arc<dyn EventWaitBlock> = self.clone();
        self.event.unregister_wait(&block);
        self.deliver(object, WaitResult::TimedOut);
    }
}

impl EventWaitBlock for WaitRegistration {
    fn satisfy(&self) -> bool {
        let object = self.object.upgrade();
        if !self.claim_counted(object.as_deref()) {
            return false;
        }
        if let Some(object) = &object {
            object.pool.shared().cancel_timer_key(self.timer_key);
        }
        self.deliver(object, WaitResult::Signaled);
        true
    }
}

/// Withdraw a registration that has not completed yet
fn abandon_wait(shared: &PoolShared, registration: &Arc<WaitRegistration>) -> bool {
    if !registration.claim() {
        return false;
    }
    let block: Arc<dyn EventWaitBlock> = registration.clone();
    registration.event.unregister_wait(&block);
    shared.cancel_timer_key(registration.timer_key);
    true
}

// ============================================================================
// Pool Object
// ============================================================================

/// Dispatch-side state of a work item, timer, wait or I/O handler
pub(crate) struct TpObject {
    id: u64,
    kind: TpObjectKind,
    pool: ThreadPool,
    options: CallbackOptions,
    target: Weak<dyn CallbackTarget>,
    group: Option<Weak<CleanupGroup>>,
    /// Callbacks queued or running, plus I/O started and not completed
    outstanding: AtomicUsize,
    closed: AtomicBool,
    /// I/O started and not yet completed or cancelled
    pending_io: AtomicUsize,
    /// Key of the armed timer entry, 0 when disarmed
    timer_key: AtomicU64,
    wait: spin::Mutex<Option<Arc<WaitRegistration>>>,
}

impl TpObject {
    /// Allocate an object id
    pub(crate) fn allocate_id() -> u64 {
        NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an object and join the environment's cleanup group
    pub(crate) fn new(
        id: u64,
        kind: TpObjectKind,
        environment: &CallbackEnvironment,
        target: Weak<dyn CallbackTarget>,
    ) -> Arc<Self> {
        let object = Arc::new(Self {
            id,
            kind,
            pool: environment.pool(),
            options: environment.options(),
            target,
            group: environment.cleanup_group().map(Arc::downgrade),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            pending_io: AtomicUsize::new(0),
            timer_key: AtomicU64::new(0),
            wait: spin::Mutex::new(None),
        });

        if let Some(group) = environment.cleanup_group() {
            group.add_member(object.clone());
        }

        log::trace!("pool object {} ({:?}) created", id, kind);
        object
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn kind(&self) -> TpObjectKind {
        self.kind
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The user-facing item, if still alive
    pub(crate) fn target(&self) -> Option<Arc<dyn CallbackTarget>> {
        self.target.upgrade()
    }

    /// Queued or running callbacks plus pending I/O
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Count a callback and hand it to the pool
    pub(crate) fn queue(self: &Arc<Self>, payload: Payload) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.queue_counted(payload);
    }

    /// Hand an already counted callback to the pool
    pub(crate) fn queue_counted(self: &Arc<Self>, payload: Payload) {
        self.pool
            .shared()
            .enqueue_object(self.clone(), payload, self.options);
    }

    /// Run one dispatched callback on the current worker
    pub(crate) fn invoke(self: &Arc<Self>, context: &DispatchContext<'_>, payload: Payload) {
        let target = if self.is_closed() { None } else { self.target.upgrade() };
        if let Some(target) = &target {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                target.run(context, payload)
            }));
            if result.is_err() {
                bugcheck!(codes::CALLBACK_RAISED_EXCEPTION, self.id, ke_get_current_thread_id());
            }
        }

        // Counted down before the item handle is released, so an item
        // dropped here never waits on its own dispatch.
        self.complete_callbacks(1);
        drop(target);
    }

    /// Drop `count` outstanding callbacks, waking waiters at zero
    pub(crate) fn complete_callbacks(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self.outstanding.fetch_sub(count, Ordering::AcqRel);
        if previous == count {
            wake_by_address_all(&self.outstanding);
        }
    }

    /// Wait until no callback is queued or running and no I/O is pending
    ///
    /// With `cancel_pending`, queued callbacks that have not started are
    /// removed first and armed timers and waits are disarmed.
    pub(crate) fn wait_for_callbacks(&self, cancel_pending: bool) {
        if cancel_pending {
            self.cancel_pending();
        }

        loop {
            let outstanding = self.outstanding.load(Ordering::Acquire);
            if outstanding == 0 {
                break;
            }
            wait_on_address(&self.outstanding, outstanding, None);
        }
    }

    /// Disarm timer and wait, and drop callbacks that have not started
    pub(crate) fn cancel_pending(&self) {
        self.cancel_timer();
        self.cancel_wait();
        if self.outstanding() != 0 {
            let removed = self.pool.shared().remove_queued(self.id);
            self.complete_callbacks(removed);
        }
    }

    /// Disarm without touching queued callbacks
    pub(crate) fn disarm(&self) {
        self.cancel_timer();
        self.cancel_wait();
    }

    /// Stop dispatching to the item; callbacks already running finish
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_pending();

        if let Some(group) = self.group.as_ref().and_then(Weak::upgrade) {
            group.remove_member(self.id);
        }
        log::trace!("pool object {} ({:?}) closed", self.id, self.kind);
    }

    /// Close on behalf of the owning group, which already drained it
    pub(crate) fn close_from_group(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel_pending();
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Arm the timer; a previously armed due time is replaced
    pub(crate) fn set_timer(self: &Arc<Self>, due: Instant) {
        let shared = self.pool.shared();
        let key = NEXT_TIMER_KEY.fetch_add(1, Ordering::Relaxed);

        let previous = self.timer_key.swap(key, Ordering::AcqRel);
        if previous != 0 {
            shared.cancel_timer_key(previous);
        }
        shared.insert_timer(TimerEntry::new(
            due,
            key,
            TimerAction::Fire {
                object: Arc::downgrade(self),
            },
        ));
    }

    /// Disarm the timer; true if it was armed
    pub(crate) fn cancel_timer(&self) -> bool {
        let previous = self.timer_key.swap(0, Ordering::AcqRel);
        if previous != 0 {
            self.pool.shared().cancel_timer_key(previous);
        }
        previous != 0
    }

    #[inline]
    pub(crate) fn is_timer_armed(&self) -> bool {
        self.timer_key.load(Ordering::Acquire) != 0
    }

    /// The timer thread reached the due time of the entry `key`
    ///
    /// The callback is counted before the timer reads as disarmed.
    pub(crate) fn fire_timer(self: &Arc<Self>, key: u64) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if self
            .timer_key
            .compare_exchange(key, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::trace!("timer object {} fired", self.id);
            self.queue_counted(Payload::Timer);
        } else {
            // Re-armed or cancelled since the entry was taken
            self.complete_callbacks(1);
        }
    }

    // ------------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------------

    /// Wait for `event`, up to `deadline`; replaces any pending wait
    pub(crate) fn set_wait(self: &Arc<Self>, event: Arc<KEvent>, deadline: Option<Instant>) {
        let registration = Arc::new(WaitRegistration {
            object: Arc::downgrade(self),
            object_id: self.id,
            timer_key: NEXT_TIMER_KEY.fetch_add(1, Ordering::Relaxed),
            event: event.clone(),
            state: AtomicU8::new(WAIT_PENDING),
        });

        let previous = self.wait.lock().replace(registration.clone());
        if let Some(previous) = previous {
            abandon_wait(self.pool.shared(), &previous);
        }

        // Never called with the slot lock held: a set on the event
        // completes registrations from inside its wait-list lock.
        if event.register_wait(registration.clone()) {
            registration.satisfy();
            return;
        }

        if let Some(deadline) = deadline {
            self.pool.shared().insert_timer(TimerEntry::new(
                deadline,
                registration.timer_key,
                TimerAction::WaitTimeout {
                    registration: Arc::downgrade(&registration),
                },
            ));
            // Signaled between registering and arming the timeout
            if !registration.is_pending() {
                self.pool.shared().cancel_timer_key(registration.timer_key);
            }
        }
    }

    /// Cancel the pending wait; true if one was pending
    pub(crate) fn cancel_wait(&self) -> bool {
        let registration = self.wait.lock().take();
        match registration {
            Some(registration) => abandon_wait(self.pool.shared(), &registration),
            None => false,
        }
    }

    pub(crate) fn is_wait_pending(&self) -> bool {
        self.wait
            .lock()
            .as_ref()
            .map_or(false, |registration| registration.is_pending())
    }

    // ------------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------------

    /// Account for an I/O about to be issued
    pub(crate) fn start_io(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.pending_io.fetch_add(1, Ordering::AcqRel);
    }

    /// An I/O accounted with `start_io` was never issued
    pub(crate) fn cancel_io(&self) {
        self.take_pending_io();
        self.complete_callbacks(1);
    }

    /// A started I/O completed; its callback inherits the I/O's count
    pub(crate) fn complete_io(self: &Arc<Self>, completion: IoCompletion) {
        self.take_pending_io();
        self.queue_counted(Payload::Io(completion));
    }

    pub(crate) fn pending_io(&self) -> usize {
        self.pending_io.load(Ordering::Acquire)
    }

    fn take_pending_io(&self) {
        let taken = self
            .pending_io
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| pending.checked_sub(1));
        if taken.is_err() {
            // Completion or cancellation without a started I/O
            bugcheck!(codes::INVALID_WORK_QUEUE_ITEM, self.id);
        }
    }
}

impl core::fmt::Debug for TpObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TpObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}
