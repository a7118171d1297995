//! Kernel Semaphore Implementation (KSEMAPHORE)
//!
//! A semaphore is a synchronization object that maintains a count.
//! Multiple threads can acquire the semaphore as long as the count
//! is greater than zero. When the count reaches zero, waiting threads
//! block until another thread releases the semaphore.
//!
//! # Usage
//! ```
//! use ntpool::ke::KSemaphore;
//!
//! // Create a semaphore with initial count 3 and max 5
//! let sem = KSemaphore::new(3, 5);
//!
//! // Thread acquires (decrements count)
//! sem.wait();  // count: 3 -> 2
//!
//! // Thread releases (increments count)
//! sem.release(1);  // count: 2 -> 3
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KSEMAPHORE / KeInitializeSemaphore / KeReleaseSemaphore

use core::sync::atomic::{AtomicI32, Ordering};
use parking_lot_core as plc;
use std::time::{Duration, Instant};

/// Kernel Semaphore
///
/// Equivalent to NT's KSEMAPHORE
pub struct KSemaphore {
    /// Current count
    count: AtomicI32,
    /// Maximum count limit
    limit: i32,
}

impl KSemaphore {
    /// Create a new semaphore
    ///
    /// # Arguments
    /// * `initial_count` - Starting count (number of available resources)
    /// * `limit` - Maximum count the semaphore can reach
    ///
    /// # Panics
    /// Panics if initial_count > limit or if either is negative
    pub const fn new(initial_count: i32, limit: i32) -> Self {
        assert!(initial_count >= 0, "initial_count must be non-negative");
        assert!(limit > 0, "limit must be positive");
        assert!(initial_count <= limit, "initial_count must not exceed limit");

        Self {
            count: AtomicI32::new(initial_count),
            limit,
        }
    }

    /// Get the current count
    #[inline]
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the maximum limit
    #[inline]
    pub fn limit(&self) -> i32 {
        self.limit
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Take one unit if available
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Wait for the semaphore (decrement count)
    pub fn wait(&self) {
        while !self.try_wait() {
            unsafe {
                plc::park(
                    self.key(),
                    || self.count.load(Ordering::Relaxed) <= 0,
                    || {},
                    |_, _| {},
                    plc::DEFAULT_PARK_TOKEN,
                    None,
                );
            }
        }
    }

    /// Wait for the semaphore with a timeout
    ///
    /// Returns true if a unit was taken, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                self.wait();
                return true;
            }
        };

        loop {
            if self.try_wait() {
                return true;
            }

            let result = unsafe {
                plc::park(
                    self.key(),
                    || self.count.load(Ordering::Relaxed) <= 0,
                    || {},
                    |_, _| {},
                    plc::DEFAULT_PARK_TOKEN,
                    Some(deadline),
                )
            };

            if result == plc::ParkResult::TimedOut {
                return self.try_wait();
            }
        }
    }

    /// Release the semaphore (increment count)
    ///
    /// # Arguments
    /// * `adjustment` - Amount to increment the count by
    ///
    /// # Returns
    /// Previous count, or `None` if the release would exceed the limit
    /// (the count is left unchanged).
    pub fn release(&self, adjustment: i32) -> Option<i32> {
        if adjustment <= 0 {
            return Some(self.count());
        }

        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(adjustment).filter(|&next| next <= self.limit)?;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        for _ in 0..adjustment {
            let result = unsafe { plc::unpark_one(self.key(), |_| plc::DEFAULT_UNPARK_TOKEN) };
            if result.unparked_threads == 0 {
                break;
            }
        }

        Some(current)
    }

    /// Release up to `adjustment` units, clamping at the limit
    ///
    /// Returns the number of units actually added.
    pub fn release_saturating(&self, adjustment: i32) -> i32 {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(adjustment.max(0)).min(self.limit);
            if next == current {
                return 0;
            }
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let added = next - current;
                    for _ in 0..added {
                        let result =
                            unsafe { plc::unpark_one(self.key(), |_| plc::DEFAULT_UNPARK_TOKEN) };
                        if result.unparked_threads == 0 {
                            break;
                        }
                    }
                    return added;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl core::fmt::Debug for KSemaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KSemaphore")
            .field("count", &self.count())
            .field("limit", &self.limit)
            .finish()
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type KSEMAPHORE = KSemaphore;

/// Release a semaphore (NT API compatibility)
#[inline]
pub fn ke_release_semaphore(semaphore: &KSemaphore, adjustment: i32) -> Option<i32> {
    semaphore.release(adjustment)
}

/// Read the count of a semaphore (NT API compatibility)
#[inline]
pub fn ke_read_state_semaphore(semaphore: &KSemaphore) -> i32 {
    semaphore.count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_counting() {
        let sem = KSemaphore::new(2, 3);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());

        assert_eq!(sem.release(1), Some(0));
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_release_over_limit_fails() {
        let sem = KSemaphore::new(2, 3);
        assert_eq!(sem.release(2), None);
        assert_eq!(sem.count(), 2);

        assert_eq!(sem.release_saturating(5), 1);
        assert_eq!(sem.count(), 3);
    }

    #[test]
    fn test_wait_timeout() {
        let sem = KSemaphore::new(0, 1);
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_release_wakes_waiters() {
        let sem = Arc::new(KSemaphore::new(0, 8));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert!(sem.release(4).is_some());

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(sem.count(), 0);
    }
}
