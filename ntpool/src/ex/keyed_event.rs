//! Address-Keyed Waits (WaitOnAddress)
//!
//! Keyed waits let a thread sleep until the value at a memory address
//! changes, without allocating a dedicated event per object. Waiters and
//! wakers are matched by the address of the watched atomic, using the
//! process-wide hashed parking lot.
//!
//! # Design
//!
//! - A waiter parks only if the atomic still holds the undesired value;
//!   the comparison runs under the parking-lot bucket lock, so a wake that
//!   follows a store can never be missed.
//! - Wakes may be spurious from the caller's point of view: callers must
//!   re-read the value and loop.
//! - Any 32-bit, 64-bit or pointer-sized atomic can be watched.
//!
//! # Windows Equivalent
//! WaitOnAddress / WakeByAddressSingle / WakeByAddressAll.
//!
//! # Usage
//! ```
//! use ntpool::ex::{wait_on_address, wake_by_address_all};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let flag = Arc::new(AtomicU32::new(0));
//!
//! let waker = {
//!     let flag = flag.clone();
//!     std::thread::spawn(move || {
//!         flag.store(1, Ordering::Release);
//!         wake_by_address_all(&*flag);
//!     })
//! };
//!
//! while flag.load(Ordering::Acquire) == 0 {
//!     wait_on_address(&*flag, 0, None);
//! }
//! waker.join().unwrap();
//! ```

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use parking_lot_core as plc;
use std::time::{Duration, Instant};

mod sealed {
    pub trait Sealed {}
}

/// An atomic whose address can be waited on
pub trait WaitableAtomic: sealed::Sealed + Sync {
    type Value: Copy + Eq;

    fn load_value(&self, order: Ordering) -> Self::Value;
}

macro_rules! impl_waitable_atomic {
    ($atomic:ty, $value:ty) => {
        impl sealed::Sealed for $atomic {}

        impl WaitableAtomic for $atomic {
            type Value = $value;

            #[inline]
            fn load_value(&self, order: Ordering) -> $value {
                self.load(order)
            }
        }
    };
}

impl_waitable_atomic!(AtomicU32, u32);
impl_waitable_atomic!(AtomicU64, u64);
impl_waitable_atomic!(AtomicUsize, usize);

#[inline]
fn address_key<A: WaitableAtomic + ?Sized>(address: &A) -> usize {
    address as *const A as *const () as usize
}

/// Wait while the value at `address` equals `undesired`
///
/// Returns false only if the timeout elapsed. A true return does not
/// guarantee the value changed; re-check and wait again as needed.
pub fn wait_on_address<A: WaitableAtomic>(
    address: &A,
    undesired: A::Value,
    timeout: Option<Duration>,
) -> bool {
    let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
    wait_on_address_until(address, undesired, deadline)
}

/// Wait while the value at `address` equals `undesired`, up to a deadline
pub fn wait_on_address_until<A: WaitableAtomic>(
    address: &A,
    undesired: A::Value,
    deadline: Option<Instant>,
) -> bool {
    if address.load_value(Ordering::Acquire) != undesired {
        return true;
    }

    let result = unsafe {
        plc::park(
            address_key(address),
            || address.load_value(Ordering::Acquire) == undesired,
            || {},
            |_, _| {},
            plc::DEFAULT_PARK_TOKEN,
            deadline,
        )
    };

    result != plc::ParkResult::TimedOut
}

/// Wake one thread waiting on `address`
pub fn wake_by_address_single<A: WaitableAtomic>(address: &A) {
    unsafe {
        plc::unpark_one(address_key(address), |_| plc::DEFAULT_UNPARK_TOKEN);
    }
}

/// Wake every thread waiting on `address`
///
/// Returns the number of threads woken.
pub fn wake_by_address_all<A: WaitableAtomic>(address: &A) -> usize {
    unsafe { plc::unpark_all(address_key(address), plc::DEFAULT_UNPARK_TOKEN) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_changed_value_returns_immediately() {
        let value = AtomicU64::new(5);
        assert!(wait_on_address(&value, 4, None));
    }

    #[test]
    fn test_timeout() {
        let value = AtomicU32::new(0);
        assert!(!wait_on_address(&value, 0, Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wake_all() {
        let value = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let value = value.clone();
                thread::spawn(move || {
                    while value.load(Ordering::Acquire) == 0 {
                        wait_on_address(&*value, 0, None);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        value.store(1, Ordering::Release);
        wake_by_address_all(&*value);

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn test_wake_single() {
        let value = Arc::new(AtomicU64::new(0));

        let waiter = {
            let value = value.clone();
            thread::spawn(move || {
                while value.load(Ordering::Acquire) == 0 {
                    wait_on_address(&*value, 0, None);
                }
            })
        };

        thread::sleep(Duration::from_millis(10));
        value.store(7, Ordering::Release);
        wake_by_address_single(&*value);
        waiter.join().unwrap();
    }
}
