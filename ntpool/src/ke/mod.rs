//! Kernel Primitives (ke)
//!
//! The lowest layer of the crate:
//!
//! - **Bug Check**: Fail-fast termination on contract violations
//! - **Events**: Notification and synchronization events
//! - **Semaphores**: Counting semaphores
//! - **Threads**: Stable thread identifiers and callback-thread tracking
//!
//! Blocking is implemented on top of `parking_lot_core`, so none of these
//! objects allocate per waiter.

pub mod bugcheck;
pub mod event;
pub mod semaphore;
pub mod thread;

pub use bugcheck::*;
pub use event::*;
pub use semaphore::*;
pub use thread::*;
