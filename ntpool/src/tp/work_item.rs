//! Work Item Base
//!
//! State machine shared by every work item variant.
//!
//! # States
//!
//! - **Ready**: Idle; may be posted
//! - **Posted**: Handed to the pool; its callback has not started yet, or
//!   the post has not been cancelled yet
//! - **Closed**: Terminal; the pool object behind the item is gone
//!
//! ```text
//!   Ready --post--> Posted --start_running / join--> Ready
//!     \                |
//!      \--close--> Closed <--close--/
//! ```
//!
//! # Posted-Item Table
//!
//! While an item is Posted, the process-wide posted-item table holds a
//! strong reference to it. A posted item therefore stays alive even if
//! every user handle is dropped, and the reference is given back exactly
//! once: by whichever of "callback starts", "join observes a cancelled
//! post" or "close" moves the item out of Posted first.
//!
//! Every transition runs under the table shard lock of the item's id,
//! which orders the state change with the table update.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ex::rundown::{Join, JoinGuard};
use crate::ke::bugcheck::codes;
use crate::ke::thread::{CallbackThreadSlot, ThreadId};
use crate::bugcheck_if;

/// Strong reference an item holds on itself while posted
pub(crate) type SelfReference = Arc<dyn Any + Send + Sync>;

/// Work item state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkItemState {
    Closed = 0x01,
    Ready = 0x02,
    Posted = 0x04,
}

impl WorkItemState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => WorkItemState::Closed,
            0x02 => WorkItemState::Ready,
            0x04 => WorkItemState::Posted,
            _ => crate::bugcheck!(codes::INVALID_WORK_ITEM_STATE, 0, raw),
        }
    }
}

// ============================================================================
// Posted-Item Table
// ============================================================================

const POSTED_TABLE_SHARDS: usize = 16;

type PostedShard = spin::Mutex<BTreeMap<u64, SelfReference>>;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SHARD: PostedShard = spin::Mutex::new(BTreeMap::new());

/// Items currently in the Posted state
static POSTED_ITEMS: [PostedShard; POSTED_TABLE_SHARDS] = [EMPTY_SHARD; POSTED_TABLE_SHARDS];

#[inline]
fn posted_shard(id: u64) -> &'static PostedShard {
    &POSTED_ITEMS[(id as usize) % POSTED_TABLE_SHARDS]
}

/// Number of items currently posted, process-wide
pub fn posted_item_count() -> usize {
    POSTED_ITEMS.iter().map(|shard| shard.lock().len()).sum()
}

// ============================================================================
// Profiling
// ============================================================================

static PROFILING_EPOCH: spin::Once<Instant> = spin::Once::new();

/// Nanoseconds since the profiling epoch, never 0
fn profiling_now() -> u64 {
    let epoch = PROFILING_EPOCH.call_once(Instant::now);
    epoch.elapsed().as_nanos() as u64 + 1
}

fn ticks_between(from: u64, to: u64) -> Duration {
    Duration::from_nanos(to.saturating_sub(from))
}

/// Scheduled / started / completed timestamps of a work item
///
/// A timestamp of 0 means "has not happened in the current cycle".
#[derive(Debug, Default)]
pub struct WorkItemProfile {
    /// When the item was posted
    scheduled: AtomicU64,
    /// When a worker picked it up
    started: AtomicU64,
    /// When its callback returned
    completed: AtomicU64,
}

impl WorkItemProfile {
    pub const fn new() -> Self {
        Self {
            scheduled: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    fn mark_scheduled(&self) {
        self.completed.store(0, Ordering::Relaxed);
        self.started.store(0, Ordering::Relaxed);
        self.scheduled.store(profiling_now(), Ordering::Release);
    }

    fn mark_started(&self) {
        self.started.store(profiling_now(), Ordering::Release);
    }

    fn mark_completed(&self) {
        self.completed.store(profiling_now(), Ordering::Release);
    }

    /// Time spent waiting for a worker (so far, if not started yet)
    pub fn wait_duration(&self) -> Duration {
        let scheduled = self.scheduled.load(Ordering::Acquire);
        if scheduled == 0 {
            return Duration::ZERO;
        }
        match self.started.load(Ordering::Acquire) {
            0 => ticks_between(scheduled, profiling_now()),
            started => ticks_between(scheduled, started),
        }
    }

    /// Time spent in the callback (so far, if still running)
    pub fn run_duration(&self) -> Duration {
        let started = self.started.load(Ordering::Acquire);
        if started == 0 {
            return Duration::ZERO;
        }
        match self.completed.load(Ordering::Acquire) {
            0 => ticks_between(started, profiling_now()),
            completed => ticks_between(started, completed),
        }
    }

    /// Time from posting to completion (so far, if not completed yet)
    pub fn duration(&self) -> Duration {
        let scheduled = self.scheduled.load(Ordering::Acquire);
        if scheduled == 0 {
            return Duration::ZERO;
        }
        match self.completed.load(Ordering::Acquire) {
            0 => ticks_between(scheduled, profiling_now()),
            completed => ticks_between(scheduled, completed),
        }
    }
}

// ============================================================================
// Work Item Base
// ============================================================================

/// State, self-reference bookkeeping and profiling shared by all variants
pub(crate) struct WorkItemBase {
    id: u64,
    state: AtomicU8,
    profile: WorkItemProfile,
    callback_thread: CallbackThreadSlot,
}

impl WorkItemBase {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkItemState::Ready as u8),
            profile: WorkItemProfile::new(),
            callback_thread: CallbackThreadSlot::new(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn state(&self) -> WorkItemState {
        WorkItemState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.state() == WorkItemState::Closed
    }

    #[inline]
    pub(crate) fn is_posted(&self) -> bool {
        self.state() == WorkItemState::Posted
    }

    #[inline]
    pub(crate) fn profile(&self) -> &WorkItemProfile {
        &self.profile
    }

    #[inline]
    pub(crate) fn callback_thread(&self) -> &CallbackThreadSlot {
        &self.callback_thread
    }

    /// Refuse a join issued from inside this item's own callback
    pub(crate) fn check_not_self_join(&self) {
        bugcheck_if!(
            self.callback_thread.is_current_thread(),
            codes::WORK_ITEM_SELF_JOIN,
            self.id,
            self.callback_thread.thread_id()
        );
    }

    /// Thread running the callback right now, or 0
    #[inline]
    pub(crate) fn worker_thread_id(&self) -> ThreadId {
        self.callback_thread.thread_id()
    }

    /// Ready -> Posted, taking the self-reference
    ///
    /// Posting an item that is not Ready is a contract violation.
    pub(crate) fn move_to_posted(&self, this: SelfReference) {
        let mut shard = posted_shard(self.id).lock();

        let old = self.state.load(Ordering::Relaxed);
        bugcheck_if!(
            old != WorkItemState::Ready as u8,
            codes::INVALID_WORK_ITEM_STATE,
            self.id,
            old,
            WorkItemState::Posted as u8
        );
        bugcheck_if!(
            shard.insert(self.id, this).is_some(),
            codes::POSTED_TABLE_CORRUPTED,
            self.id
        );

        self.profile.mark_scheduled();
        self.state.store(WorkItemState::Posted as u8, Ordering::Release);
        drop(shard);

        log::trace!("work item {} posted", self.id);
    }

    /// Posted -> Ready (Closed is left alone)
    ///
    /// Returns the self-reference if this call took the item out of
    /// Posted. The caller drops it after the shard lock is released.
    #[must_use]
    pub(crate) fn move_to_ready(&self) -> Option<SelfReference> {
        let mut shard = posted_shard(self.id).lock();

        match WorkItemState::from_raw(self.state.load(Ordering::Relaxed)) {
            WorkItemState::Closed => None,
            WorkItemState::Ready => None,
            WorkItemState::Posted => {
                self.state.store(WorkItemState::Ready as u8, Ordering::Release);
                let this = shard.remove(&self.id);
                bugcheck_if!(this.is_none(), codes::POSTED_TABLE_CORRUPTED, self.id);
                this
            }
        }
    }

    /// Any state -> Closed, giving back the self-reference if posted
    #[must_use]
    pub(crate) fn move_to_closed(&self) -> Option<SelfReference> {
        let mut shard = posted_shard(self.id).lock();

        let old = self.state.swap(WorkItemState::Closed as u8, Ordering::AcqRel);
        if old == WorkItemState::Posted as u8 {
            shard.remove(&self.id)
        } else {
            None
        }
    }

    /// A worker picked the item up
    #[must_use]
    pub(crate) fn start_running(&self) -> Option<SelfReference> {
        self.profile.mark_started();
        self.move_to_ready()
    }

    /// The callback returned
    pub(crate) fn complete_running(&self) {
        self.profile.mark_completed();
    }

    /// A join finished: a post that never ran goes back to Ready
    pub(crate) fn join_complete(&self) {
        drop(self.move_to_ready());
    }
}

impl Drop for WorkItemBase {
    fn drop(&mut self) {
        bugcheck_if!(
            self.state.load(Ordering::Acquire) == WorkItemState::Posted as u8,
            codes::WORK_ITEM_DESTROYED_WHILE_POSTED,
            self.id
        );
    }
}

// ============================================================================
// Common Interface
// ============================================================================

/// Join and cancellation shared by work, timer and wait items
pub trait WorkItemControl: Join {
    /// Cancel callbacks that have not started, then wait for the rest
    fn try_cancel_and_join(&self);

    /// The item was closed by its cleanup group (or is being destroyed)
    fn is_closed(&self) -> bool;

    /// Thread running the item's callback right now, or 0
    fn worker_thread_id(&self) -> ThreadId;
}

/// Joins a shared work item when dropped
pub type ScopedJoin<T> = JoinGuard<Arc<T>>;
