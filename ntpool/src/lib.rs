//! NT-style Thread Pool Services
//!
//! Safe wrappers around a thread pool dispatch facility, built on the same
//! layering as the NT executive:
//!
//! - **ke**: Kernel primitives (bug check, events, semaphores, thread ids)
//! - **ex**: Executive services (address-keyed waits, rundown protection)
//! - **tp**: Thread pool objects (work, timer, wait and I/O items, cleanup groups)
//!
//! # Lifetime Model
//!
//! Every pool object is reference counted. While a work item is posted the
//! posted-item table holds a strong reference to it, so the item cannot be
//! destroyed before its callback has started or the post has been cancelled.
//! Rundown counters let owners fence off a resource and wait until every
//! outstanding user has left.
//!
//! # Usage
//! ```no_run
//! use ntpool::ex::BlockingRundown;
//! use ntpool::tp;
//! use std::sync::Arc;
//!
//! let rundown = Arc::new(BlockingRundown::new());
//!
//! for _ in 0..16 {
//!     let rundown = rundown.clone();
//!     if rundown.try_acquire() {
//!         tp::submit_work(move |_instance| {
//!             // ... use the resource ...
//!             rundown.release();
//!         });
//!     }
//! }
//!
//! // Refuse new users and wait for the outstanding ones
//! rundown.join();
//! ```

pub mod error;
pub mod ex;
pub mod ke;
pub mod tp;

pub use error::{Error, Result};
