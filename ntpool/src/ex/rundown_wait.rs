//! Waitable Rundowns
//!
//! Two flavours of [`RundownCounter`] that can be joined: `join` starts
//! rundown and blocks until every outstanding reference is released.
//!
//! - [`BlockingRundown`]: completion is signalled through a notification
//!   event, which other threads can also wait on or poll.
//! - [`LightweightRundown`]: waiters sleep on the counter's own state word
//!   with address-keyed waits; no event object is kept.
//!
//! Both join when dropped, so the owner of a resource can embed one and
//! rely on drop order to wait out its users.
//!
//! # Usage
//! ```
//! use ntpool::ex::LightweightRundown;
//! use std::sync::Arc;
//!
//! let rundown = Arc::new(LightweightRundown::new());
//!
//! let users: Vec<_> = (0..4)
//!     .filter(|_| rundown.try_acquire())
//!     .map(|_| {
//!         let rundown = rundown.clone();
//!         std::thread::spawn(move || rundown.release())
//!     })
//!     .collect();
//!
//! rundown.join();
//! for user in users {
//!     user.join().unwrap();
//! }
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

use super::keyed_event::{wait_on_address, wake_by_address_all};
use super::rundown::{
    Join, RestartOutcome, Rundown, RundownCounter, RundownPolicy, RUNDOWN_CANCEL_BIT,
    RUNDOWN_COUNT_MASK,
};
use crate::error::Result;
use crate::ke::bugcheck::codes;
use crate::ke::event::KEvent;
use crate::bugcheck_if;

// ============================================================================
// Blocking Rundown
// ============================================================================

/// Signals a notification event when rundown completes
pub struct EventPolicy {
    event: KEvent,
}

impl EventPolicy {
    fn new() -> Self {
        Self {
            event: KEvent::notification(false),
        }
    }
}

impl RundownPolicy for EventPolicy {
    fn try_start(&self, restart: bool) -> bool {
        if restart {
            self.event.reset();
        }
        true
    }

    fn on_rundown_complete(&self, _state: &AtomicU64) {
        self.event.set();
    }
}

/// Rundown whose completion is signalled through an event
pub struct BlockingRundown {
    counter: RundownCounter<EventPolicy>,
}

impl BlockingRundown {
    pub fn new() -> Self {
        Self {
            counter: RundownCounter::with_policy(EventPolicy::new()),
        }
    }

    /// Event signaled once rundown has completed
    pub fn completion_event(&self) -> &KEvent {
        &self.counter.policy().event
    }

    pub fn acquire(&self) -> Result<()> {
        self.counter.acquire()
    }

    pub fn acquire_bounded(&self, max_count: u64) -> Result<()> {
        self.counter.acquire_bounded(max_count)
    }

    pub fn try_acquire(&self) -> bool {
        self.counter.try_acquire()
    }

    pub fn try_acquire_bounded(&self, max_count: u64) -> bool {
        self.counter.try_acquire_bounded(max_count)
    }

    pub fn release(&self) {
        self.counter.release()
    }

    /// Refuse new references; true if rundown is already complete
    pub fn start_rundown(&self) -> bool {
        self.counter.start_rundown()
    }

    /// Reopen after a completed rundown
    ///
    /// The event policy never refuses, so the outcome is always accepted.
    pub fn restart(&self) -> RestartOutcome {
        self.counter.restart()
    }

    /// Start rundown and wait for all references to be released
    pub fn join(&self) {
        self.counter.start_rundown();
        self.completion_event().wait();
    }

    pub fn is_running(&self, order: Ordering) -> bool {
        self.counter.is_running(order)
    }

    pub fn is_running_down(&self, order: Ordering) -> bool {
        self.counter.is_running_down(order)
    }

    pub fn is_rundown_complete(&self, order: Ordering) -> bool {
        self.counter.is_rundown_complete(order)
    }

    pub fn count(&self, order: Ordering) -> u64 {
        self.counter.count(order)
    }
}

impl Default for BlockingRundown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockingRundown {
    fn drop(&mut self) {
        self.join();
    }
}

impl Rundown for BlockingRundown {
    fn acquire(&self) -> Result<()> {
        self.counter.acquire()
    }

    fn try_acquire(&self) -> bool {
        self.counter.try_acquire()
    }

    fn release(&self) {
        self.counter.release()
    }
}

impl Join for BlockingRundown {
    fn join(&self) {
        BlockingRundown::join(self)
    }
}

// ============================================================================
// Lightweight Rundown
// ============================================================================

/// Wakes address-keyed waiters on the state word when rundown completes
#[derive(Debug, Default)]
pub struct AddressWakePolicy;

impl RundownPolicy for AddressWakePolicy {
    fn on_rundown_complete(&self, state: &AtomicU64) {
        wake_by_address_all(state);
    }
}

/// Rundown whose joiners wait on the counter word itself
pub struct LightweightRundown {
    counter: RundownCounter<AddressWakePolicy>,
}

impl LightweightRundown {
    pub const fn new_const() -> Self {
        Self {
            counter: RundownCounter::with_policy_started(AddressWakePolicy),
        }
    }

    pub fn new() -> Self {
        Self::new_const()
    }

    pub fn acquire(&self) -> Result<()> {
        self.counter.acquire()
    }

    pub fn acquire_bounded(&self, max_count: u64) -> Result<()> {
        self.counter.acquire_bounded(max_count)
    }

    pub fn try_acquire(&self) -> bool {
        self.counter.try_acquire()
    }

    pub fn try_acquire_bounded(&self, max_count: u64) -> bool {
        self.counter.try_acquire_bounded(max_count)
    }

    pub fn release(&self) {
        self.counter.release()
    }

    /// Refuse new references; true if rundown is already complete
    pub fn start_rundown(&self) -> bool {
        self.counter.start_rundown()
    }

    /// Reopen after a completed rundown
    ///
    /// This flavour cannot refuse; a refusal is a contract violation.
    pub fn restart(&self) {
        let outcome = self.counter.restart();
        bugcheck_if!(
            !outcome.accepted,
            codes::RUNDOWN_RESTART_REFUSED,
            self as *const Self as usize
        );
    }

    /// Start rundown and wait for all references to be released
    pub fn join(&self) {
        if self.counter.start_rundown() {
            return;
        }

        let state = self.counter.state_word();
        loop {
            let current = state.load(Ordering::Acquire);
            bugcheck_if!(
                current & RUNDOWN_CANCEL_BIT == 0,
                codes::RUNDOWN_WAIT_INCONSISTENT,
                self as *const Self as usize,
                current
            );
            if current & RUNDOWN_COUNT_MASK == 0 {
                break;
            }
            wait_on_address(state, current, None);
        }
    }

    pub fn is_running(&self, order: Ordering) -> bool {
        self.counter.is_running(order)
    }

    pub fn is_running_down(&self, order: Ordering) -> bool {
        self.counter.is_running_down(order)
    }

    pub fn is_rundown_complete(&self, order: Ordering) -> bool {
        self.counter.is_rundown_complete(order)
    }

    pub fn count(&self, order: Ordering) -> u64 {
        self.counter.count(order)
    }
}

impl Default for LightweightRundown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LightweightRundown {
    fn drop(&mut self) {
        self.join();
    }
}

impl Rundown for LightweightRundown {
    fn acquire(&self) -> Result<()> {
        self.counter.acquire()
    }

    fn try_acquire(&self) -> bool {
        self.counter.try_acquire()
    }

    fn release(&self) {
        self.counter.release()
    }
}

impl Join for LightweightRundown {
    fn join(&self) {
        LightweightRundown::join(self)
    }
}
