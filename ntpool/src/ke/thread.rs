//! Thread identifiers
//!
//! Every thread that touches the crate is given a small, stable, nonzero
//! identifier on first use (the equivalent of a client-id thread id).
//! Identifier 0 is reserved to mean "no thread".
//!
//! [`CallbackThreadSlot`] records which thread is currently running a
//! particular object's callback. The thread pool uses it to refuse joins
//! issued from inside the callback being joined.
//!
//! Objects whose callbacks may run on several threads at once cannot use a
//! single slot. For those, each thread remembers the objects whose
//! callbacks it is running ([`ke_enter_object_callback`]).

use core::cell::RefCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

/// Thread identifier; never 0 for a live thread
pub type ThreadId = u64;

/// No thread
pub const INVALID_THREAD_ID: ThreadId = 0;

/// Next identifier to hand out
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static CURRENT_THREAD_ID: ThreadId = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);

    /// Objects whose callbacks the current thread is running, innermost last
    static RUNNING_CALLBACKS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Get the identifier of the calling thread
#[inline]
pub fn ke_get_current_thread_id() -> ThreadId {
    CURRENT_THREAD_ID.with(|id| *id)
}

/// Mark the calling thread as running a callback of `object_id`
///
/// The mark is removed when the returned scope is dropped.
pub fn ke_enter_object_callback(object_id: u64) -> ObjectCallbackScope {
    RUNNING_CALLBACKS.with(|running| running.borrow_mut().push(object_id));
    ObjectCallbackScope {
        object_id,
        _not_send: PhantomData,
    }
}

/// True when the calling thread is inside a callback of `object_id`
pub fn ke_is_in_object_callback(object_id: u64) -> bool {
    RUNNING_CALLBACKS.with(|running| running.borrow().contains(&object_id))
}

/// Clears a per-thread callback mark when dropped
pub struct ObjectCallbackScope {
    object_id: u64,
    // Must be dropped on the thread that entered it
    _not_send: PhantomData<*const ()>,
}

impl Drop for ObjectCallbackScope {
    fn drop(&mut self) {
        RUNNING_CALLBACKS.with(|running| {
            let mut running = running.borrow_mut();
            if let Some(index) = running.iter().rposition(|id| *id == self.object_id) {
                running.remove(index);
            }
        });
    }
}

/// Records the thread executing an object's callback
pub struct CallbackThreadSlot {
    thread_id: AtomicU64,
}

impl CallbackThreadSlot {
    pub const fn new() -> Self {
        Self {
            thread_id: AtomicU64::new(INVALID_THREAD_ID),
        }
    }

    /// Mark the calling thread as the callback thread until the scope ends
    pub fn enter(&self) -> CallbackThreadScope<'_> {
        self.thread_id.store(ke_get_current_thread_id(), Ordering::Release);
        CallbackThreadScope { slot: self }
    }

    /// Thread currently in the callback, or [`INVALID_THREAD_ID`]
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id.load(Ordering::Acquire)
    }

    /// True when called from inside the tracked callback
    #[inline]
    pub fn is_current_thread(&self) -> bool {
        self.thread_id() == ke_get_current_thread_id()
    }
}

impl Default for CallbackThreadSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the callback thread slot when dropped
pub struct CallbackThreadScope<'a> {
    slot: &'a CallbackThreadSlot,
}

impl Drop for CallbackThreadScope<'_> {
    fn drop(&mut self) {
        self.slot.thread_id.store(INVALID_THREAD_ID, Ordering::Release);
    }
}
