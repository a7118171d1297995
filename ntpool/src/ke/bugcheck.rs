//! Bug Check (fail-fast termination)
//!
//! Contract violations inside the pool and rundown machinery are not
//! recoverable: a counter that underflows or a work item that is destroyed
//! while posted means memory that other threads still use is in an unknown
//! state. Such conditions raise a bug check, which:
//!
//! 1. Prevents recursive bug checks
//! 2. Records the STOP code and its four parameters
//! 3. Logs the failure and writes a STOP line to stderr
//! 4. Runs registered bug check callbacks
//! 5. Aborts the process
//!
//! # Bug Check Codes
//!
//! STOP codes are 32-bit values identifying the violated contract. The
//! meaning of the four parameters depends on the code and is documented
//! next to each constant in [`codes`].
//!
//! # Windows Equivalent
//! This mirrors NT's KeBugCheckEx and KeRegisterBugCheckCallback.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::io::Write;

/// Bug check has been initiated (prevents recursive bugcheck)
static BUGCHECK_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Counter for nested bugcheck attempts
static BUGCHECK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Bug check data - saved for callbacks and diagnostics
static BUGCHECK_DATA: spin::Mutex<Option<BugCheckData>> = spin::Mutex::new(None);

/// Maximum number of registered bug check callbacks
pub const MAX_BUGCHECK_CALLBACKS: usize = 16;

/// Bug check callback routine
pub type BugCheckCallback = fn(&BugCheckData);

/// Registered bug check callbacks
static BUGCHECK_CALLBACKS: spin::Mutex<Vec<BugCheckCallback>> = spin::Mutex::new(Vec::new());

/// Bug check information structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BugCheckData {
    /// The bug check code
    pub code: u32,
    /// First parameter
    pub parameter1: u64,
    /// Second parameter
    pub parameter2: u64,
    /// Third parameter
    pub parameter3: u64,
    /// Fourth parameter
    pub parameter4: u64,
}

// ============================================================================
// Bug Check Codes (STOP Codes)
// ============================================================================

pub mod codes {
    //! Bug check codes raised by the rundown and thread pool layers

    /// RUNDOWN_COUNT_UNDERFLOW (0xA001)
    /// Release without a matching acquisition
    /// Parameter1: Address of the counter
    /// Parameter2: State word before the release
    pub const RUNDOWN_COUNT_UNDERFLOW: u32 = 0x0000A001;

    /// RUNDOWN_NOT_COMPLETE (0xA002)
    /// Counter destroyed while not cancelled-and-idle
    /// Parameter1: Address of the counter
    /// Parameter2: State word at destruction
    pub const RUNDOWN_NOT_COMPLETE: u32 = 0x0000A002;

    /// INVALID_RUNDOWN_RESTART (0xA003)
    /// Restart on a counter that has not completed rundown
    /// Parameter1: Address of the counter
    /// Parameter2: State word replaced by the restart
    pub const INVALID_RUNDOWN_RESTART: u32 = 0x0000A003;

    /// RUNDOWN_RESTART_REFUSED (0xA004)
    /// A rundown flavour that cannot refuse a restart was refused
    /// Parameter1: Address of the counter
    pub const RUNDOWN_RESTART_REFUSED: u32 = 0x0000A004;

    /// RUNDOWN_WAIT_INCONSISTENT (0xA005)
    /// A rundown waiter observed a counter that is not cancelled
    /// Parameter1: Address of the counter
    /// Parameter2: Observed state word
    pub const RUNDOWN_WAIT_INCONSISTENT: u32 = 0x0000A005;

    /// WORK_ITEM_SELF_JOIN (0xA101)
    /// Join requested from inside the item's own callback
    /// Parameter1: Work item id
    /// Parameter2: Calling thread id
    pub const WORK_ITEM_SELF_JOIN: u32 = 0x0000A101;

    /// INVALID_WORK_ITEM_STATE (0xA102)
    /// Illegal work item state transition
    /// Parameter1: Work item id
    /// Parameter2: State before the transition
    /// Parameter3: Requested state
    pub const INVALID_WORK_ITEM_STATE: u32 = 0x0000A102;

    /// WORK_ITEM_DESTROYED_WHILE_POSTED (0xA103)
    /// Parameter1: Work item id
    pub const WORK_ITEM_DESTROYED_WHILE_POSTED: u32 = 0x0000A103;

    /// POSTED_TABLE_CORRUPTED (0xA104)
    /// Posted-item table disagrees with the item state
    /// Parameter1: Work item id
    pub const POSTED_TABLE_CORRUPTED: u32 = 0x0000A104;

    /// IO_HANDLER_CLOSED (0xA105)
    /// I/O started or abandoned on a closed handler
    /// Parameter1: Handler id
    pub const IO_HANDLER_CLOSED: u32 = 0x0000A105;

    /// CALLBACK_RAISED_EXCEPTION (0xA106)
    /// A pool callback panicked
    /// Parameter1: Pool object id (0 for submitted callbacks)
    /// Parameter2: Worker thread id
    pub const CALLBACK_RAISED_EXCEPTION: u32 = 0x0000A106;

    /// THREAD_POOL_INITIALIZATION_FAILED (0xA107)
    /// The pool could not create any worker thread
    /// Parameter1: OS error code (0 if unknown)
    pub const THREAD_POOL_INITIALIZATION_FAILED: u32 = 0x0000A107;

    /// INVALID_WORK_QUEUE_ITEM (0x96)
    /// A dispatch entry does not match its pool object
    /// Parameter1: Pool object id
    pub const INVALID_WORK_QUEUE_ITEM: u32 = 0x00000096;

    /// MANUALLY_INITIATED_CRASH (0xE2)
    pub const MANUALLY_INITIATED_CRASH: u32 = 0x000000E2;
}

// ============================================================================
// Bug Check Display
// ============================================================================

/// Get the human-readable name for a bug check code
pub fn bugcheck_code_name(code: u32) -> &'static str {
    match code {
        codes::RUNDOWN_COUNT_UNDERFLOW => "RUNDOWN_COUNT_UNDERFLOW",
        codes::RUNDOWN_NOT_COMPLETE => "RUNDOWN_NOT_COMPLETE",
        codes::INVALID_RUNDOWN_RESTART => "INVALID_RUNDOWN_RESTART",
        codes::RUNDOWN_RESTART_REFUSED => "RUNDOWN_RESTART_REFUSED",
        codes::RUNDOWN_WAIT_INCONSISTENT => "RUNDOWN_WAIT_INCONSISTENT",
        codes::WORK_ITEM_SELF_JOIN => "WORK_ITEM_SELF_JOIN",
        codes::INVALID_WORK_ITEM_STATE => "INVALID_WORK_ITEM_STATE",
        codes::WORK_ITEM_DESTROYED_WHILE_POSTED => "WORK_ITEM_DESTROYED_WHILE_POSTED",
        codes::POSTED_TABLE_CORRUPTED => "POSTED_TABLE_CORRUPTED",
        codes::IO_HANDLER_CLOSED => "IO_HANDLER_CLOSED",
        codes::CALLBACK_RAISED_EXCEPTION => "CALLBACK_RAISED_EXCEPTION",
        codes::THREAD_POOL_INITIALIZATION_FAILED => "THREAD_POOL_INITIALIZATION_FAILED",
        codes::INVALID_WORK_QUEUE_ITEM => "INVALID_WORK_QUEUE_ITEM",
        codes::MANUALLY_INITIATED_CRASH => "MANUALLY_INITIATED_CRASH",
        _ => "UNKNOWN_BUGCHECK",
    }
}

/// Write the STOP report to stderr
fn display_bugcheck(data: &BugCheckData) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();

    // Nothing useful can be done if stderr is gone; keep going to abort.
    let _ = writeln!(out);
    let _ = writeln!(out, "*** STOP: 0x{:08X} ({})", data.code, bugcheck_code_name(data.code));
    let _ = writeln!(
        out,
        "*** STOP: 0x{:08X} (0x{:016X}, 0x{:016X}, 0x{:016X}, 0x{:016X})",
        data.code, data.parameter1, data.parameter2, data.parameter3, data.parameter4
    );
    let _ = out.flush();
}

// ============================================================================
// Bug Check Functions
// ============================================================================

/// Terminate the process with a bug check code
pub fn ke_bugcheck(code: u32) -> ! {
    ke_bugcheck_ex(code, 0, 0, 0, 0)
}

/// Terminate the process with a bug check code and parameters
///
/// # Arguments
/// * `code` - The bug check code identifying the error
/// * `p1` - First parameter (meaning depends on code)
/// * `p2` - Second parameter
/// * `p3` - Third parameter
/// * `p4` - Fourth parameter
///
/// # Never Returns
/// The process is aborted; no destructors run and no unwinding happens.
#[cold]
pub fn ke_bugcheck_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    // A bug check raised from a callback or from the display path
    // must not re-enter; abort straight away.
    let count = BUGCHECK_COUNT.fetch_add(1, Ordering::SeqCst);
    if count > 0 {
        let _ = writeln!(std::io::stderr(), "!!! RECURSIVE BUGCHECK 0x{:08X} !!!", code);
        std::process::abort();
    }

    BUGCHECK_ACTIVE.store(true, Ordering::SeqCst);

    let data = BugCheckData {
        code,
        parameter1: p1,
        parameter2: p2,
        parameter3: p3,
        parameter4: p4,
    };
    *BUGCHECK_DATA.lock() = Some(data);

    log::error!(
        "bugcheck {} (0x{:08X}) parameters 0x{:X} 0x{:X} 0x{:X} 0x{:X}",
        bugcheck_code_name(code),
        code,
        p1,
        p2,
        p3,
        p4
    );

    display_bugcheck(&data);

    // Copy the list out so a callback that registers another one cannot deadlock.
    let callbacks: Vec<BugCheckCallback> = match BUGCHECK_CALLBACKS.try_lock() {
        Some(list) => list.clone(),
        None => Vec::new(),
    };
    for callback in callbacks {
        callback(&data);
    }

    std::process::abort()
}

/// Register a routine to run before the process is aborted by a bug check
///
/// Returns false when the callback table is full.
pub fn ke_register_bugcheck_callback(callback: BugCheckCallback) -> bool {
    let mut callbacks = BUGCHECK_CALLBACKS.lock();
    if callbacks.len() >= MAX_BUGCHECK_CALLBACKS {
        return false;
    }
    callbacks.push(callback);
    true
}

/// Remove a previously registered bug check callback
pub fn ke_deregister_bugcheck_callback(callback: BugCheckCallback) -> bool {
    let mut callbacks = BUGCHECK_CALLBACKS.lock();
    match callbacks.iter().position(|&registered| registered as usize == callback as usize) {
        Some(index) => {
            callbacks.remove(index);
            true
        }
        None => false,
    }
}

/// Check if a bugcheck is currently active
pub fn is_bugcheck_active() -> bool {
    BUGCHECK_ACTIVE.load(Ordering::SeqCst)
}

/// Get the current bugcheck data (if active)
pub fn get_bugcheck_data() -> Option<BugCheckData> {
    if is_bugcheck_active() {
        *BUGCHECK_DATA.lock()
    } else {
        None
    }
}

// ============================================================================
// Convenience Macros
// ============================================================================

/// Raise a bug check with up to four parameters
#[macro_export]
macro_rules! bugcheck {
    ($code:expr) => {
        $crate::ke::bugcheck::ke_bugcheck($code)
    };
    ($code:expr, $p1:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, 0, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr, $p4:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, $p4 as u64)
    };
}

/// Raise a bug check when a condition holds
///
/// `bugcheck_if!(cond, CODE, p1, ...)` is the assertion form used at
/// contract checks.
#[macro_export]
macro_rules! bugcheck_if {
    ($cond:expr, $code:expr $(, $param:expr)* $(,)?) => {
        if $cond {
            $crate::bugcheck!($code $(, $param)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names() {
        assert_eq!(bugcheck_code_name(codes::RUNDOWN_NOT_COMPLETE), "RUNDOWN_NOT_COMPLETE");
        assert_eq!(bugcheck_code_name(codes::WORK_ITEM_SELF_JOIN), "WORK_ITEM_SELF_JOIN");
        assert_eq!(bugcheck_code_name(0xDEAD), "UNKNOWN_BUGCHECK");
    }

    #[test]
    fn test_no_bugcheck_by_default() {
        assert!(!is_bugcheck_active());
        assert!(get_bugcheck_data().is_none());
    }

    #[test]
    fn test_callback_registration() {
        fn on_bugcheck(_data: &BugCheckData) {}

        assert!(ke_register_bugcheck_callback(on_bugcheck));
        assert!(ke_deregister_bugcheck_callback(on_bugcheck));
        assert!(!ke_deregister_bugcheck_callback(on_bugcheck));
    }

    #[test]
    fn test_bugcheck_if_false_is_noop() {
        let state = 0u64;
        bugcheck_if!(state != 0, codes::MANUALLY_INITIATED_CRASH, state);
    }
}
