//! Kernel Event Implementation (KEVENT)
//!
//! Events are synchronization objects used for signaling between threads.
//! A thread can wait for an event to be signaled, and another thread
//! can signal the event to wake the waiting thread(s).
//!
//! Two types of events:
//! - **Notification (Manual Reset)**: Stays signaled until explicitly reset.
//!   Wakes ALL waiting threads when signaled.
//! - **Synchronization (Auto Reset)**: Automatically resets after waking
//!   ONE thread. Only one waiter is released per signal.
//!
//! Besides blocked threads an event also keeps a list of asynchronous wait
//! blocks. The thread pool registers one per scheduled wait; setting the
//! event satisfies the blocks the same way it releases threads (all of them
//! for a notification event, one for a synchronization event).
//!
//! # Usage
//! ```
//! use ntpool::ke::{EventType, KEvent};
//! use std::sync::Arc;
//!
//! let event = Arc::new(KEvent::new(EventType::Notification, false));
//!
//! let waiter = {
//!     let event = event.clone();
//!     std::thread::spawn(move || event.wait())
//! };
//!
//! event.set();
//! waiter.join().unwrap();
//! ```

use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot_core as plc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Notification event (manual reset)
    /// - Wakes ALL waiters when signaled
    /// - Stays signaled until explicitly reset
    Notification = 0,
    /// Synchronization event (auto reset)
    /// - Wakes ONE waiter when signaled
    /// - Automatically resets after waking a thread
    Synchronization = 1,
}

/// Asynchronous waiter registered on an event
pub(crate) trait EventWaitBlock: Send + Sync {
    /// Deliver the signal
    ///
    /// Returns false when the block was already completed by another path
    /// (timeout or cancellation), in which case the signal is not consumed.
    fn satisfy(&self) -> bool;
}

/// Kernel Event
///
/// Equivalent to NT's KEVENT
pub struct KEvent {
    /// Signal state
    signaled: AtomicBool,
    /// Event type (notification or synchronization)
    event_type: EventType,
    /// Registered asynchronous wait blocks, oldest first
    wait_list: spin::Mutex<VecDeque<Arc<dyn EventWaitBlock>>>,
}

impl KEvent {
    /// Create a new event
    ///
    /// # Arguments
    /// * `event_type` - Notification (manual reset) or Synchronization (auto reset)
    /// * `initial_state` - true = signaled, false = not signaled
    pub const fn new(event_type: EventType, initial_state: bool) -> Self {
        Self {
            signaled: AtomicBool::new(initial_state),
            event_type,
            wait_list: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Manual-reset event
    pub const fn notification(initial_state: bool) -> Self {
        Self::new(EventType::Notification, initial_state)
    }

    /// Auto-reset event
    pub const fn synchronization(initial_state: bool) -> Self {
        Self::new(EventType::Synchronization, initial_state)
    }

    /// Get the event type
    #[inline]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Check if the event is signaled
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Consume the signal if this wait is satisfied by it
    fn try_consume(&self) -> bool {
        match self.event_type {
            EventType::Notification => self.signaled.load(Ordering::Acquire),
            EventType::Synchronization => self.signaled.swap(false, Ordering::Acquire),
        }
    }

    /// Set (signal) the event
    ///
    /// For notification events: satisfies every wait block, wakes all
    /// waiters, stays signaled.
    /// For synchronization events: satisfies one wait block or wakes one
    /// waiter; stays signaled only if nobody was waiting.
    ///
    /// Returns the previous signal state
    pub fn set(&self) -> bool {
        match self.event_type {
            EventType::Notification => {
                let (was_signaled, blocks) = {
                    let mut wait_list = self.wait_list.lock();
                    let was_signaled = self.signaled.swap(true, Ordering::Release);
                    (was_signaled, wait_list.drain(..).collect::<Vec<_>>())
                };

                for block in blocks {
                    block.satisfy();
                }

                if !was_signaled {
                    unsafe {
                        plc::unpark_all(self.key(), plc::DEFAULT_UNPARK_TOKEN);
                    }
                }
                was_signaled
            }
            EventType::Synchronization => {
                // Held across the unpark so a concurrent register_wait either
                // sees the resulting signal state or is satisfied here.
                let mut wait_list = self.wait_list.lock();
                let was_signaled = self.signaled.load(Ordering::Relaxed);

                while let Some(block) = wait_list.pop_front() {
                    if block.satisfy() {
                        return was_signaled;
                    }
                }

                unsafe {
                    plc::unpark_one(self.key(), |result| {
                        if result.unparked_threads == 0 {
                            self.signaled.store(true, Ordering::Release);
                        } else {
                            self.signaled.store(false, Ordering::Relaxed);
                        }
                        plc::DEFAULT_UNPARK_TOKEN
                    });
                }
                was_signaled
            }
        }
    }

    /// Reset (clear) the event
    ///
    /// Returns the previous signal state
    pub fn reset(&self) -> bool {
        self.signaled.swap(false, Ordering::Relaxed)
    }

    /// Wait for the event to be signaled
    pub fn wait(&self) {
        if self.try_consume() {
            return;
        }

        // A synchronization set hands the signal straight to the thread it
        // unparks, so a single park is enough for either event type.
        unsafe {
            plc::park(
                self.key(),
                || !self.try_consume(),
                || {},
                |_, _| {},
                plc::DEFAULT_PARK_TOKEN,
                None,
            );
        }
    }

    /// Wait for the event with a timeout
    ///
    /// Returns true if the event was signaled, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Wait for the event until an absolute deadline
    ///
    /// Returns true if the event was signaled, false on timeout.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.try_consume() {
            return true;
        }

        let result = unsafe {
            plc::park(
                self.key(),
                || !self.try_consume(),
                || {},
                |_, _| {},
                plc::DEFAULT_PARK_TOKEN,
                Some(deadline),
            )
        };

        result != plc::ParkResult::TimedOut
    }

    /// Register an asynchronous wait block
    ///
    /// Returns true when the event is already signaled; the signal is
    /// consumed as for a waiting thread and the block is NOT queued, so the
    /// caller must complete it itself.
    pub(crate) fn register_wait(&self, block: Arc<dyn EventWaitBlock>) -> bool {
        let mut wait_list = self.wait_list.lock();
        if self.try_consume() {
            return true;
        }
        wait_list.push_back(block);
        false
    }

    /// Remove a wait block that completed through another path
    pub(crate) fn unregister_wait(&self, block: &Arc<dyn EventWaitBlock>) {
        let target = Arc::as_ptr(block) as *const ();
        self.wait_list
            .lock()
            .retain(|queued| Arc::as_ptr(queued) as *const () != target);
    }

    /// Number of registered wait blocks
    pub fn wait_block_count(&self) -> usize {
        self.wait_list.lock().len()
    }
}

impl core::fmt::Debug for KEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KEvent")
            .field("event_type", &self.event_type)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

// NT API compatibility type aliases
#[allow(non_camel_case_types)]
pub type KEVENT = KEvent;

#[allow(non_camel_case_types)]
pub type EVENT_TYPE = EventType;

/// Set an event (NT API compatibility)
#[inline]
pub fn ke_set_event(event: &KEvent) -> bool {
    event.set()
}

/// Reset an event (NT API compatibility)
#[inline]
pub fn ke_reset_event(event: &KEvent) -> bool {
    event.reset()
}

/// Read the signal state of an event (NT API compatibility)
#[inline]
pub fn ke_read_state_event(event: &KEvent) -> bool {
    event.is_signaled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use std::thread;

    struct CountingBlock {
        fired: AtomicUsize,
        accept: bool,
    }

    impl EventWaitBlock for CountingBlock {
        fn satisfy(&self) -> bool {
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    #[test]
    fn test_notification_event_wakes_all() {
        let event = Arc::new(KEvent::notification(false));
        let woken = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    event.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert!(!event.set());
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
        assert!(event.is_signaled());

        assert!(event.reset());
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_synchronization_event_auto_resets() {
        let event = KEvent::synchronization(false);

        event.set();
        assert!(event.is_signaled());
        event.wait();
        assert!(!event.is_signaled());

        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_synchronization_event_releases_one_waiter() {
        let event = Arc::new(KEvent::synchronization(false));
        let released = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let event = event.clone();
                let released = released.clone();
                thread::spawn(move || {
                    if event.wait_timeout(Duration::from_millis(300)) {
                        released.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        event.set();

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = KEvent::notification(false);
        let start = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_blocks_on_notification_event() {
        let event = KEvent::notification(false);
        let block = Arc::new(CountingBlock { fired: AtomicUsize::new(0), accept: true });

        assert!(!event.register_wait(block.clone()));
        assert_eq!(event.wait_block_count(), 1);

        event.set();
        assert_eq!(block.fired.load(Ordering::SeqCst), 1);
        assert_eq!(event.wait_block_count(), 0);

        // Already signaled: satisfied inline, not queued
        assert!(event.register_wait(block.clone()));
        assert_eq!(event.wait_block_count(), 0);
    }

    #[test]
    fn test_wait_block_consumes_synchronization_signal() {
        let event = KEvent::synchronization(false);
        let stale = Arc::new(CountingBlock { fired: AtomicUsize::new(0), accept: false });
        let live = Arc::new(CountingBlock { fired: AtomicUsize::new(0), accept: true });

        event.register_wait(stale.clone());
        event.register_wait(live.clone());

        event.set();
        assert_eq!(stale.fired.load(Ordering::SeqCst), 1);
        assert_eq!(live.fired.load(Ordering::SeqCst), 1);
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_unregister_wait() {
        let event = KEvent::notification(false);
        let block: Arc<dyn EventWaitBlock> =
            Arc::new(CountingBlock { fired: AtomicUsize::new(0), accept: true });

        event.register_wait(block.clone());
        event.unregister_wait(&block);
        assert_eq!(event.wait_block_count(), 0);
    }
}
