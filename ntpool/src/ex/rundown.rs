//! Rundown Protection Implementation (EX_RUNDOWN_REF)
//!
//! Rundown protection is a mechanism that allows safe resource cleanup.
//! It tracks references to a resource and allows waiting until all
//! references are released before the resource can be safely destroyed.
//!
//! # NT Semantics
//!
//! - Used to protect objects during cleanup/teardown
//! - Acquiring a reference prevents rundown from completing
//! - After initiating rundown, new references fail
//! - The counter can be restarted once rundown has completed
//!
//! # Usage
//! ```
//! use ntpool::ex::RundownCounter;
//!
//! let rundown = RundownCounter::new();
//!
//! // Users acquire references
//! if rundown.try_acquire() {
//!     // ... use the resource ...
//!     rundown.release();
//! }
//!
//! // During cleanup, refuse new users
//! assert!(rundown.start_rundown());
//! assert!(rundown.is_rundown_complete(core::sync::atomic::Ordering::Acquire));
//! ```
//!
//! # States
//!
//! - Bit 63: Cancelled (new acquires will fail)
//! - Bits 0-62: Reference count
//!
//! | cancelled | count | state          |
//! |-----------|-------|----------------|
//! | 0         | any   | running        |
//! | 1         | > 0   | running down   |
//! | 1         | 0     | rundown complete |
//!
//! # Policies
//!
//! A [`RundownPolicy`] observes the lifecycle: `try_start` may veto a
//! start or restart, `on_first_acquire` / `on_last_release` bracket busy
//! periods, and `on_rundown_complete` runs exactly once per cancel cycle,
//! on the thread that observed the counter become cancelled-and-idle.

use core::ops::Deref;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ke::bugcheck::codes;
use crate::{bugcheck, bugcheck_if};

/// Bit indicating rundown is active
pub const RUNDOWN_CANCEL_BIT: u64 = 1 << 63;

/// Mask for the count portion
pub const RUNDOWN_COUNT_MASK: u64 = !RUNDOWN_CANCEL_BIT;

/// Largest reference count a counter can hold
pub const RUNDOWN_MAX_COUNT: u64 = RUNDOWN_COUNT_MASK;

/// Increment value for reference count
const RUNDOWN_COUNT_INC: u64 = 1;

#[inline]
const fn is_cancelled(state: u64) -> bool {
    state & RUNDOWN_CANCEL_BIT != 0
}

#[inline]
const fn decoded_count(state: u64) -> u64 {
    state & RUNDOWN_COUNT_MASK
}

#[inline]
const fn is_idle(state: u64) -> bool {
    decoded_count(state) == 0
}

/// Lifecycle hooks of a rundown counter
pub trait RundownPolicy {
    /// Accept or refuse a start (`restart == false`) or restart
    fn try_start(&self, restart: bool) -> bool {
        let _ = restart;
        true
    }

    /// The count went from 0 to 1
    fn on_first_acquire(&self) {}

    /// The count went from 1 to 0
    fn on_last_release(&self) {}

    /// The counter became cancelled and idle
    ///
    /// `state` is the counter's state word, for policies that wake
    /// address-keyed waiters.
    fn on_rundown_complete(&self, state: &AtomicU64) {
        let _ = state;
    }
}

/// Policy that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicy;

impl RundownPolicy for NoopPolicy {}

/// Something rundown references can be taken on
pub trait Rundown {
    /// Take a reference, reporting why it failed
    fn acquire(&self) -> Result<()>;

    /// Take a reference
    fn try_acquire(&self) -> bool {
        self.acquire().is_ok()
    }

    /// Return a reference taken with `acquire` / `try_acquire`
    fn release(&self);
}

/// Something that can be waited out
pub trait Join {
    fn join(&self);
}

/// Result of [`RundownCounter::restart`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartOutcome {
    /// The policy accepted the restart and the counter is running again
    pub accepted: bool,
    /// The counter was cancelled and idle when the restart was considered
    pub was_idle: bool,
}

/// Rundown counter
///
/// Equivalent to NT's EX_RUNDOWN_REF, extended with a cancel/restart cycle
/// and a policy type parameter.
pub struct RundownCounter<P: RundownPolicy = NoopPolicy> {
    /// Combined cancel flag and reference count
    state: AtomicU64,
    policy: P,
}

impl RundownCounter<NoopPolicy> {
    /// Create a new running counter
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            policy: NoopPolicy,
        }
    }
}

impl Default for RundownCounter<NoopPolicy> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RundownPolicy> RundownCounter<P> {
    /// Create a running counter with a policy that must accept the start
    ///
    /// A refused start is a contract violation; use [`Self::try_with_policy`]
    /// for policies that may refuse.
    pub fn with_policy(policy: P) -> Self {
        match Self::try_with_policy(policy) {
            Ok(counter) => counter,
            Err(_) => bugcheck!(codes::RUNDOWN_RESTART_REFUSED, 0),
        }
    }

    /// Create a running counter without consulting `try_start`
    ///
    /// For policies that accept every start; usable in statics.
    pub const fn with_policy_started(policy: P) -> Self {
        Self {
            state: AtomicU64::new(0),
            policy,
        }
    }

    /// Create a running counter, or fail if the policy refuses to start
    pub fn try_with_policy(policy: P) -> Result<Self> {
        // Starts out complete so that a refused counter drops cleanly.
        let counter = Self {
            state: AtomicU64::new(RUNDOWN_CANCEL_BIT),
            policy,
        };

        if !counter.policy.try_start(false) {
            return Err(Error::RundownActive);
        }

        counter.state.store(0, Ordering::Release);
        Ok(counter)
    }

    /// Get the policy
    #[inline]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// The raw state word
    #[inline]
    pub(crate) fn state_word(&self) -> &AtomicU64 {
        &self.state
    }

    #[inline]
    fn address(&self) -> u64 {
        self as *const Self as usize as u64
    }

    /// Acquire a rundown reference
    ///
    /// Fails with [`Error::RundownActive`] once rundown has started, and with
    /// [`Error::CounterOverflow`] when the count is at its maximum.
    pub fn acquire(&self) -> Result<()> {
        self.acquire_bounded(RUNDOWN_MAX_COUNT)
    }

    /// Acquire a rundown reference unless the count already reaches `max_count`
    ///
    /// The count never exceeds `max_count`, even under contention.
    pub fn acquire_bounded(&self, max_count: u64) -> Result<()> {
        let max_count = max_count.min(RUNDOWN_MAX_COUNT);
        let mut current = self.state.load(Ordering::Relaxed);

        loop {
            if is_cancelled(current) {
                return Err(Error::RundownActive);
            }
            if decoded_count(current) >= max_count {
                return Err(Error::CounterOverflow);
            }

            // Acquire pairs with the release in restart, so the resource
            // state published before restarting is visible here.
            match self.state.compare_exchange_weak(
                current,
                current + RUNDOWN_COUNT_INC,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if decoded_count(current) == 0 {
            self.policy.on_first_acquire();
        }
        Ok(())
    }

    /// Try to acquire a rundown reference
    ///
    /// Returns true if acquired; you MUST call release() when done.
    pub fn try_acquire(&self) -> bool {
        self.acquire_bounded(RUNDOWN_MAX_COUNT).is_ok()
    }

    /// Try to acquire unless the count already reaches `max_count`
    pub fn try_acquire_bounded(&self, max_count: u64) -> bool {
        self.acquire_bounded(max_count).is_ok()
    }

    /// Release a rundown reference
    ///
    /// Must be called exactly once for each successful acquire. The release
    /// that drains a cancelled counter runs the rundown-complete hook.
    pub fn release(&self) {
        let old = self.state.fetch_sub(RUNDOWN_COUNT_INC, Ordering::Release);
        bugcheck_if!(
            is_idle(old),
            codes::RUNDOWN_COUNT_UNDERFLOW,
            self.address(),
            old
        );

        if decoded_count(old) == 1 {
            self.policy.on_last_release();
            if is_cancelled(old) {
                // Synchronize with every earlier release and with the
                // thread that started rundown.
                fence(Ordering::Acquire);
                self.policy.on_rundown_complete(&self.state);
            }
        }
    }

    /// Start rundown: refuse all further acquisitions
    ///
    /// Returns true if the counter was idle, i.e. rundown is already
    /// complete. Idempotent; only the first call of a cycle on an idle
    /// counter runs the rundown-complete hook.
    pub fn start_rundown(&self) -> bool {
        // Release publishes this thread's changes to anyone who observes
        // the cancel bit.
        let old = self.state.fetch_or(RUNDOWN_CANCEL_BIT, Ordering::Release);
        let idle = is_idle(old);

        if idle {
            fence(Ordering::Acquire);
            if !is_cancelled(old) {
                self.policy.on_rundown_complete(&self.state);
            }
        }
        idle
    }

    /// Reopen a counter whose rundown has completed
    ///
    /// The policy is asked first; if it refuses, nothing changes. Restarting
    /// a counter that is not cancelled-and-idle is a contract violation.
    pub fn restart(&self) -> RestartOutcome {
        if !self.policy.try_start(true) {
            return RestartOutcome {
                accepted: false,
                was_idle: self.is_rundown_complete(Ordering::Relaxed),
            };
        }

        // Release pairs with the acquire in acquire_bounded.
        let previous = self.state.swap(0, Ordering::Release);
        bugcheck_if!(
            !(is_cancelled(previous) && is_idle(previous)),
            codes::INVALID_RUNDOWN_RESTART,
            self.address(),
            previous
        );

        RestartOutcome {
            accepted: true,
            was_idle: true,
        }
    }

    /// Not cancelled
    ///
    /// Callers using the counter as a cancellation flag should pass
    /// `Ordering::Acquire` to observe changes made before rundown started.
    #[inline]
    pub fn is_running(&self, order: Ordering) -> bool {
        !is_cancelled(self.state.load(order))
    }

    /// Cancelled with references still outstanding
    #[inline]
    pub fn is_running_down(&self, order: Ordering) -> bool {
        let state = self.state.load(order);
        is_cancelled(state) && !is_idle(state)
    }

    /// Cancelled and idle
    #[inline]
    pub fn is_rundown_complete(&self, order: Ordering) -> bool {
        let state = self.state.load(order);
        is_cancelled(state) && is_idle(state)
    }

    /// Get the current reference count
    #[inline]
    pub fn count(&self, order: Ordering) -> u64 {
        decoded_count(self.state.load(order))
    }
}

impl<P: RundownPolicy> Rundown for RundownCounter<P> {
    fn acquire(&self) -> Result<()> {
        self.acquire_bounded(RUNDOWN_MAX_COUNT)
    }

    fn try_acquire(&self) -> bool {
        self.try_acquire_bounded(RUNDOWN_MAX_COUNT)
    }

    fn release(&self) {
        RundownCounter::release(self)
    }
}

impl<P: RundownPolicy> Drop for RundownCounter<P> {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Acquire);
        bugcheck_if!(
            !(is_cancelled(state) && is_idle(state)),
            codes::RUNDOWN_NOT_COMPLETE,
            self.address(),
            state
        );
    }
}

impl<P: RundownPolicy> core::fmt::Debug for RundownCounter<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("RundownCounter")
            .field("cancelled", &is_cancelled(state))
            .field("count", &decoded_count(state))
            .finish()
    }
}

// ============================================================================
// Hierarchical Rundown
// ============================================================================

/// Policy tying a counter to a master rundown
///
/// Each start or restart takes a reference on the master, and completing
/// rundown returns it. A master that is running down therefore refuses to
/// let its children start, and cannot complete while a child is running.
pub struct MasterPolicy<R: Rundown + ?Sized> {
    master: Arc<R>,
    master_acquired: AtomicBool,
}

impl<R: Rundown + ?Sized> MasterPolicy<R> {
    pub fn new(master: Arc<R>) -> Self {
        Self {
            master,
            master_acquired: AtomicBool::new(false),
        }
    }

    /// The master rundown
    pub fn master(&self) -> &Arc<R> {
        &self.master
    }
}

impl<R: Rundown + ?Sized> RundownPolicy for MasterPolicy<R> {
    fn try_start(&self, _restart: bool) -> bool {
        let acquired = self.master.try_acquire();
        self.master_acquired.store(acquired, Ordering::Release);
        acquired
    }

    fn on_rundown_complete(&self, _state: &AtomicU64) {
        if self.master_acquired.swap(false, Ordering::AcqRel) {
            self.master.release();
        }
    }
}

// ============================================================================
// Guards
// ============================================================================

/// RAII guard for a rundown reference
///
/// Automatically releases the reference when dropped. The handle can be a
/// plain reference or any smart pointer to a [`Rundown`].
pub struct RundownGuard<H>
where
    H: Deref,
    H::Target: Rundown,
{
    rundown: Option<H>,
}

impl<H> RundownGuard<H>
where
    H: Deref,
    H::Target: Rundown,
{
    /// Acquire a reference, reporting why it failed
    pub fn new(rundown: H) -> Result<Self> {
        rundown.acquire()?;
        Ok(Self {
            rundown: Some(rundown),
        })
    }

    /// Try to acquire a reference
    ///
    /// Returns Some(guard) if acquired, None if rundown is active.
    pub fn try_new(rundown: H) -> Option<Self> {
        if rundown.try_acquire() {
            Some(Self {
                rundown: Some(rundown),
            })
        } else {
            None
        }
    }

    /// Still holding the reference
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.rundown.is_some()
    }

    /// Release the reference early
    pub fn release(&mut self) {
        if let Some(rundown) = self.rundown.take() {
            rundown.release();
        }
    }

    /// The guarded rundown, while armed
    pub fn rundown(&self) -> Option<&H::Target> {
        self.rundown.as_deref()
    }
}

impl<H> Drop for RundownGuard<H>
where
    H: Deref,
    H::Target: Rundown,
{
    fn drop(&mut self) {
        self.release();
    }
}

/// Joins its target when dropped
///
/// Joins at most once: after `join`, `disarm` or `detach` the guard is
/// empty until something is attached again.
pub struct JoinGuard<H>
where
    H: Deref,
    H::Target: Join,
{
    target: Option<H>,
}

impl<H> JoinGuard<H>
where
    H: Deref,
    H::Target: Join,
{
    pub fn new(target: H) -> Self {
        Self {
            target: Some(target),
        }
    }

    /// A guard with nothing attached
    pub fn empty() -> Self {
        Self { target: None }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.target.is_some()
    }

    /// Join the target now
    pub fn join(&mut self) {
        if let Some(target) = self.target.take() {
            target.join();
        }
    }

    /// Forget the target without joining it
    pub fn disarm(&mut self) {
        self.target = None;
    }

    /// Join the current target (if different) and guard `target` instead
    pub fn attach(&mut self, target: H) {
        if let Some(current) = &self.target {
            if core::ptr::eq(&**current, &*target) {
                return;
            }
        }
        self.join();
        self.target = Some(target);
    }

    /// Take the target out without joining it
    pub fn detach(&mut self) -> Option<H> {
        self.target.take()
    }
}

impl<H> Drop for JoinGuard<H>
where
    H: Deref,
    H::Target: Join,
{
    fn drop(&mut self) {
        self.join();
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type EX_RUNDOWN_REF = RundownCounter;

/// Acquire rundown protection (NT API compatibility)
#[inline]
pub fn ex_acquire_rundown_protection<P: RundownPolicy>(rundown: &RundownCounter<P>) -> bool {
    rundown.try_acquire()
}

/// Acquire several references at once (NT API compatibility)
///
/// All-or-nothing: on failure no reference is held.
pub fn ex_acquire_rundown_protection_ex<P: RundownPolicy>(
    rundown: &RundownCounter<P>,
    count: u32,
) -> bool {
    for taken in 0..count {
        if !rundown.try_acquire() {
            for _ in 0..taken {
                rundown.release();
            }
            return false;
        }
    }
    true
}

/// Release rundown protection (NT API compatibility)
#[inline]
pub fn ex_release_rundown_protection<P: RundownPolicy>(rundown: &RundownCounter<P>) {
    rundown.release();
}

/// Re-initialize rundown protection after completion (NT API compatibility)
#[inline]
pub fn ex_reinitialize_rundown_protection<P: RundownPolicy>(rundown: &RundownCounter<P>) -> bool {
    rundown.restart().accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingPolicy {
        refuse_restart: AtomicBool,
        first_acquires: AtomicUsize,
        last_releases: AtomicUsize,
        completions: AtomicUsize,
    }

    impl RundownPolicy for RecordingPolicy {
        fn try_start(&self, restart: bool) -> bool {
            !(restart && self.refuse_restart.load(Ordering::Relaxed))
        }

        fn on_first_acquire(&self) {
            self.first_acquires.fetch_add(1, Ordering::Relaxed);
        }

        fn on_last_release(&self) {
            self.last_releases.fetch_add(1, Ordering::Relaxed);
        }

        fn on_rundown_complete(&self, _state: &AtomicU64) {
            self.completions.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_basic_rundown() {
        let rundown = RundownCounter::new();

        // Acquire and release
        assert!(rundown.try_acquire());
        assert_eq!(rundown.count(Ordering::Relaxed), 1);
        rundown.release();
        assert_eq!(rundown.count(Ordering::Relaxed), 0);

        // Start rundown on an idle counter
        assert!(rundown.start_rundown());
        assert!(!rundown.is_running(Ordering::Relaxed));
        assert!(rundown.is_rundown_complete(Ordering::Relaxed));

        // Can't acquire after rundown
        assert!(!rundown.try_acquire());
        assert!(matches!(rundown.acquire(), Err(Error::RundownActive)));
    }

    #[test]
    fn test_multiple_references() {
        let rundown = RundownCounter::new();

        assert!(rundown.try_acquire());
        assert!(rundown.try_acquire());
        assert!(rundown.try_acquire());
        assert_eq!(rundown.count(Ordering::Relaxed), 3);

        assert!(!rundown.start_rundown());
        assert!(rundown.is_running_down(Ordering::Relaxed));

        rundown.release();
        rundown.release();
        assert!(rundown.is_running_down(Ordering::Relaxed));
        rundown.release();
        assert!(rundown.is_rundown_complete(Ordering::Relaxed));
    }

    #[test]
    fn test_bounded_acquire() {
        let rundown = RundownCounter::new();

        assert!(rundown.try_acquire_bounded(2));
        assert!(rundown.try_acquire_bounded(2));
        assert!(!rundown.try_acquire_bounded(2));
        assert!(matches!(rundown.acquire_bounded(2), Err(Error::CounterOverflow)));
        assert_eq!(rundown.count(Ordering::Relaxed), 2);

        // A zero bound never admits anyone
        assert!(!rundown.try_acquire_bounded(0));

        rundown.release();
        rundown.release();
        rundown.start_rundown();
    }

    #[test]
    fn test_cancel_wins_over_overflow() {
        let rundown = RundownCounter::new();
        assert!(rundown.try_acquire_bounded(1));
        rundown.start_rundown();

        assert!(matches!(rundown.acquire_bounded(1), Err(Error::RundownActive)));
        rundown.release();
    }

    #[test]
    fn test_start_rundown_is_idempotent() {
        let rundown = RundownCounter::with_policy(RecordingPolicy::default());

        assert!(rundown.start_rundown());
        assert!(rundown.start_rundown());
        assert_eq!(rundown.policy().completions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_policy_hooks() {
        let rundown = RundownCounter::with_policy(RecordingPolicy::default());

        assert!(rundown.try_acquire());
        assert!(rundown.try_acquire());
        rundown.release();
        rundown.release();
        assert_eq!(rundown.policy().first_acquires.load(Ordering::Relaxed), 1);
        assert_eq!(rundown.policy().last_releases.load(Ordering::Relaxed), 1);
        assert_eq!(rundown.policy().completions.load(Ordering::Relaxed), 0);

        assert!(rundown.try_acquire());
        assert!(!rundown.start_rundown());
        assert_eq!(rundown.policy().completions.load(Ordering::Relaxed), 0);
        rundown.release();
        assert_eq!(rundown.policy().completions.load(Ordering::Relaxed), 1);

        // Starting again after completion does not fire a second time
        assert!(rundown.start_rundown());
        assert_eq!(rundown.policy().completions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_restart() {
        let rundown = RundownCounter::with_policy(RecordingPolicy::default());
        rundown.start_rundown();

        let outcome = rundown.restart();
        assert!(outcome.accepted);
        assert!(outcome.was_idle);
        assert!(rundown.is_running(Ordering::Relaxed));
        assert!(rundown.try_acquire());
        rundown.release();

        rundown.start_rundown();
        rundown.policy().refuse_restart.store(true, Ordering::Relaxed);
        let outcome = rundown.restart();
        assert!(!outcome.accepted);
        assert!(rundown.is_rundown_complete(Ordering::Relaxed));
    }

    #[test]
    fn test_refused_start() {
        struct Refuse;
        impl RundownPolicy for Refuse {
            fn try_start(&self, _restart: bool) -> bool {
                false
            }
        }

        assert!(matches!(
            RundownCounter::try_with_policy(Refuse),
            Err(Error::RundownActive)
        ));
    }

    #[test]
    fn test_master_policy() {
        let master = Arc::new(RundownCounter::new());
        let child = RundownCounter::with_policy(MasterPolicy::new(master.clone()));
        assert_eq!(master.count(Ordering::Relaxed), 1);

        assert!(child.try_acquire());
        assert!(!child.start_rundown());
        assert_eq!(master.count(Ordering::Relaxed), 1);
        child.release();
        assert_eq!(master.count(Ordering::Relaxed), 0);

        // The master refuses a restart of the child while it runs down
        master.start_rundown();
        assert!(!child.restart().accepted);
        assert!(master.is_rundown_complete(Ordering::Relaxed));

        assert!(master.restart().accepted);
        assert!(child.restart().accepted);
        assert_eq!(master.count(Ordering::Relaxed), 1);
        assert!(child.start_rundown());
        assert_eq!(master.count(Ordering::Relaxed), 0);
        master.start_rundown();
    }

    #[test]
    fn test_rundown_guard() {
        let rundown = RundownCounter::new();

        {
            let guard = RundownGuard::try_new(&rundown);
            assert!(guard.is_some());
            assert_eq!(rundown.count(Ordering::Relaxed), 1);
        }

        // Guard dropped, reference released
        assert_eq!(rundown.count(Ordering::Relaxed), 0);

        let mut guard = RundownGuard::new(&rundown).unwrap();
        assert!(guard.is_armed());
        guard.release();
        assert!(!guard.is_armed());
        assert_eq!(rundown.count(Ordering::Relaxed), 0);
        drop(guard);

        rundown.start_rundown();
        assert!(RundownGuard::try_new(&rundown).is_none());
        assert!(matches!(RundownGuard::new(&rundown), Err(Error::RundownActive)));
    }

    #[test]
    fn test_join_guard() {
        struct CountingJoin(AtomicUsize);
        impl Join for CountingJoin {
            fn join(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let first = CountingJoin(AtomicUsize::new(0));
        let second = CountingJoin(AtomicUsize::new(0));

        {
            let mut guard = JoinGuard::new(&first);
            guard.attach(&first);
            assert_eq!(first.0.load(Ordering::Relaxed), 0);

            guard.attach(&second);
            assert_eq!(first.0.load(Ordering::Relaxed), 1);

            guard.join();
            guard.join();
            assert!(!guard.is_armed());
            assert_eq!(second.0.load(Ordering::Relaxed), 1);

            guard.attach(&second);
            assert!(guard.detach().is_some());
        }
        assert_eq!(second.0.load(Ordering::Relaxed), 1);

        {
            let mut guard = JoinGuard::new(&first);
            guard.disarm();
        }
        assert_eq!(first.0.load(Ordering::Relaxed), 1);

        {
            let _guard = JoinGuard::new(&first);
        }
        assert_eq!(first.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_acquire_ex() {
        let rundown = RundownCounter::new();
        assert!(ex_acquire_rundown_protection_ex(&rundown, 3));
        assert_eq!(rundown.count(Ordering::Relaxed), 3);
        for _ in 0..3 {
            ex_release_rundown_protection(&rundown);
        }
        rundown.start_rundown();
        assert!(!ex_acquire_rundown_protection_ex(&rundown, 2));
        assert!(ex_reinitialize_rundown_protection(&rundown));
        assert!(ex_acquire_rundown_protection(&rundown));
        rundown.release();
        rundown.start_rundown();
    }
}
