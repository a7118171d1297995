//! Executive Services (ex)
//!
//! Services layered on the kernel primitives:
//!
//! - **Keyed Waits**: Sleep until the value at an address changes
//! - **Rundown Protection**: Safe resource cleanup with cancel/restart cycles
//! - **Waitable Rundowns**: Event-backed and address-wait-backed joins
//!
//! # Key Structures
//!
//! - `RundownCounter`: Packed cancel bit plus reference count
//! - `BlockingRundown` / `LightweightRundown`: Joinable rundowns
//! - `RundownGuard` / `JoinGuard`: Scoped release and scoped join

pub mod keyed_event;
pub mod rundown;
pub mod rundown_wait;

// Re-exports for convenience
pub use keyed_event::*;
pub use rundown::*;
pub use rundown_wait::*;
