//! Callback Environment
//!
//! Describes where and how an object's callbacks run: which pool, which
//! cleanup group (if any), at what priority, and with which hints.
//!
//! Equivalent to NT's TP_CALLBACK_ENVIRON.

use std::sync::Arc;

use bitflags::bitflags;

use super::cleanup::CleanupGroup;
use super::pool::ThreadPool;

/// Callback priority
///
/// Each priority has its own queue; workers drain higher queues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum CallbackPriority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl CallbackPriority {
    /// Number of priority levels
    pub const COUNT: usize = 3;

    /// All priorities, highest first
    pub const ALL: [CallbackPriority; Self::COUNT] =
        [CallbackPriority::High, CallbackPriority::Normal, CallbackPriority::Low];

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Callback hints
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallbackFlags: u32 {
        /// The callback may block for a long time; keep a spare worker
        /// available while it runs
        const RUNS_LONG = 0x0000_0001;
    }
}

/// Per-object callback options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallbackOptions {
    pub priority: CallbackPriority,
    pub flags: CallbackFlags,
}

impl CallbackOptions {
    pub const fn new() -> Self {
        Self {
            priority: CallbackPriority::Normal,
            flags: CallbackFlags::empty(),
        }
    }

    pub const fn with_priority(mut self, priority: CallbackPriority) -> Self {
        self.priority = priority;
        self
    }

    pub const fn with_flags(mut self, flags: CallbackFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Shorthand for adding [`CallbackFlags::RUNS_LONG`]
    pub const fn runs_long(mut self) -> Self {
        self.flags = self.flags.union(CallbackFlags::RUNS_LONG);
        self
    }
}

/// Binds pool objects to a pool, an optional cleanup group and options
#[derive(Clone, Default)]
pub struct CallbackEnvironment {
    pub(crate) pool: Option<ThreadPool>,
    pub(crate) group: Option<Arc<CleanupGroup>>,
    pub(crate) options: CallbackOptions,
}

impl CallbackEnvironment {
    /// The system pool, no cleanup group, default options
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Make objects created with this environment members of `group`
    ///
    /// The group's pool is used unless a pool is set explicitly.
    pub fn with_cleanup_group(mut self, group: Arc<CleanupGroup>) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_options(mut self, options: CallbackOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: CallbackPriority) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn options(&self) -> CallbackOptions {
        self.options
    }

    pub fn cleanup_group(&self) -> Option<&Arc<CleanupGroup>> {
        self.group.as_ref()
    }

    /// The pool objects will be dispatched on
    pub fn pool(&self) -> ThreadPool {
        match (&self.pool, &self.group) {
            (Some(pool), _) => pool.clone(),
            (None, Some(group)) => group.pool().clone(),
            (None, None) => ThreadPool::system().clone(),
        }
    }
}

impl core::fmt::Debug for CallbackEnvironment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackEnvironment")
            .field("pool", &self.pool.is_some())
            .field("group", &self.group.is_some())
            .field("options", &self.options)
            .finish()
    }
}
