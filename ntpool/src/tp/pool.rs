//! Thread Pool (Dispatch Facility)
//!
//! Runs callbacks of pool objects and plain submissions on a set of
//! worker threads.
//!
//! # Structure
//!
//! - Three FIFO queues, one per [`CallbackPriority`]; workers always
//!   drain the highest non-empty queue first
//! - A counting semaphore announcing queued work to idle workers
//! - A due-time sorted timer list served by one timer thread, which arms
//!   timer objects and times out waits
//! - Workers are started on demand up to `max_threads` whenever queued
//!   work outnumbers idle workers, and retire after `idle_timeout`
//!   without work while more than `min_threads` are alive
//!
//! Equivalent to NT's TP_POOL.
//!
//! # Lifetime
//!
//! [`ThreadPool`] is a cheap handle. Every pool object holds one, so a
//! pool lives until the last handle and the last object are gone; the
//! final drop shuts the pool down, lets workers drain the queues and
//! joins every thread except the one doing the drop.
//!
//! The process-wide [`ThreadPool::system`] pool is created on first use
//! and never shut down.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::cleanup::CleanupGroup;
use super::environment::{CallbackEnvironment, CallbackFlags, CallbackOptions, CallbackPriority};
use super::instance::CallbackInstance;
use super::io::IoHandler;
use super::object::{DispatchContext, IoCompletion, Payload, TpObject, WaitRegistration, WaitResult};
use super::timer::TimerWorkItem;
use super::wait::WaitWorkItem;
use super::work::WorkItem;
use crate::error::{Error, Result};
use crate::ke::bugcheck::codes;
use crate::ke::event::KEvent;
use crate::ke::semaphore::KSemaphore;
use crate::ke::thread::ke_get_current_thread_id;
use crate::bugcheck;

/// Next pool id, for diagnostics
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide default pool
static SYSTEM_POOL: spin::Once<ThreadPool> = spin::Once::new();

/// Callback of a plain submission
pub(crate) type SimpleCallback = Box<dyn FnOnce(&CallbackInstance<'_>) + Send + 'static>;

// ============================================================================
// Configuration
// ============================================================================

/// Construction-time pool settings
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Workers kept alive while idle
    pub min_threads: usize,
    /// Upper bound on concurrently alive workers
    pub max_threads: usize,
    /// Worker stack size; the platform default when `None`
    pub stack_size: Option<usize>,
    /// Prefix of worker thread names
    pub thread_name: String,
    /// How long a worker above `min_threads` waits for work before exiting
    pub idle_timeout: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let parallelism = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);

        Self {
            min_threads: 1,
            max_threads: parallelism.max(2),
            stack_size: None,
            thread_name: String::from("tp-worker"),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl ThreadPoolConfig {
    pub fn with_threads(mut self, min_threads: usize, max_threads: usize) -> Self {
        self.min_threads = min_threads;
        self.max_threads = max_threads;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// At least one worker, and no more minimum than maximum
    fn normalized(mut self) -> Self {
        self.max_threads = self.max_threads.max(1);
        self.min_threads = self.min_threads.min(self.max_threads);
        self
    }
}

// ============================================================================
// Queue and Timer Entries
// ============================================================================

/// What a queued entry runs
pub(crate) enum Dispatch {
    Object {
        object: Arc<TpObject>,
        payload: Payload,
    },
    Simple {
        callback: SimpleCallback,
    },
}

struct QueuedDispatch {
    dispatch: Dispatch,
    options: CallbackOptions,
    queued_at: Instant,
}

impl QueuedDispatch {
    fn belongs_to(&self, object_id: u64) -> bool {
        match &self.dispatch {
            Dispatch::Object { object, .. } => object.id() == object_id,
            Dispatch::Simple { .. } => false,
        }
    }
}

/// What happens when a timer entry comes due
pub(crate) enum TimerAction {
    /// Queue a timer object's callback
    Fire { object: Weak<TpObject> },
    /// Complete a wait registration with a timeout
    WaitTimeout { registration: Weak<WaitRegistration> },
}

/// Entry of the due-time sorted timer list
pub(crate) struct TimerEntry {
    due: Instant,
    key: u64,
    action: TimerAction,
}

impl TimerEntry {
    pub(crate) fn new(due: Instant, key: u64, action: TimerAction) -> Self {
        Self { due, key, action }
    }

    fn expire(self) {
        match self.action {
            TimerAction::Fire { object } => {
                if let Some(object) = object.upgrade() {
                    object.fire_timer(self.key);
                }
            }
            TimerAction::WaitTimeout { registration } => {
                if let Some(registration) = registration.upgrade() {
                    registration.time_out();
                }
            }
        }
    }
}

// ============================================================================
// Shared Pool State
// ============================================================================

/// State shared by the pool handle, its workers and its timer thread
pub(crate) struct PoolShared {
    id: u64,
    config: ThreadPoolConfig,
    /// Pending dispatches, indexed by priority
    queues: [spin::Mutex<VecDeque<QueuedDispatch>>; CallbackPriority::COUNT],
    /// Entries across all queues
    queued: AtomicUsize,
    /// One unit per queued dispatch (plus wake-ups at shutdown)
    work_available: KSemaphore,
    /// Armed timers and wait timeouts, sorted by due time
    timers: spin::Mutex<Vec<TimerEntry>>,
    /// Wakes the timer thread when the earliest due time changes
    timer_event: KEvent,
    shutdown: AtomicBool,
    idle_workers: AtomicUsize,
    live_workers: AtomicUsize,
    next_thread_index: AtomicUsize,
    threads: spin::Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    fn new(config: ThreadPoolConfig) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            queues: [
                spin::Mutex::new(VecDeque::new()),
                spin::Mutex::new(VecDeque::new()),
                spin::Mutex::new(VecDeque::new()),
            ],
            queued: AtomicUsize::new(0),
            work_available: KSemaphore::new(0, i32::MAX),
            timers: spin::Mutex::new(Vec::new()),
            timer_event: KEvent::synchronization(false),
            shutdown: AtomicBool::new(false),
            idle_workers: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            next_thread_index: AtomicUsize::new(0),
            threads: spin::Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------------

    fn spawn_thread<F>(&self, name: String, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder.spawn(body).map_err(Error::ThreadCreation)?;

        let mut threads = self.threads.lock();
        threads.retain(|thread| !thread.is_finished());
        threads.push(handle);
        Ok(())
    }

    /// Start a worker unless `max_threads` are alive
    ///
    /// Returns Ok(false) when already at the maximum.
    fn spawn_worker(self: &Arc<Self>) -> Result<bool> {
        let mut live = self.live_workers.load(Ordering::Acquire);
        loop {
            if live >= self.config.max_threads {
                return Ok(false);
            }
            match self.live_workers.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }

        let index = self.next_thread_index.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.config.thread_name, index);
        let shared = self.clone();

        match self.spawn_thread(name, move || shared.worker_main()) {
            Ok(()) => {
                log::debug!("pool {}: worker {} started ({} alive)", self.id, index, live + 1);
                Ok(true)
            }
            Err(error) => {
                self.live_workers.fetch_sub(1, Ordering::AcqRel);
                Err(error)
            }
        }
    }

    /// Start a worker because queued work outnumbers idle workers
    fn grow(self: &Arc<Self>) {
        if let Err(error) = self.spawn_worker() {
            if self.live_workers.load(Ordering::Acquire) == 0 {
                // Nobody would ever run the queued work.
                bugcheck!(codes::THREAD_POOL_INITIALIZATION_FAILED, error.code(), self.id);
            }
            log::warn!("pool {}: could not add a worker: {}", self.id, error);
        }
    }

    /// Make sure some other worker can serve the queues
    ///
    /// True if a worker is idle or a new one was started.
    pub(crate) fn ensure_spare_worker(self: &Arc<Self>) -> bool {
        if self.idle_workers.load(Ordering::Acquire) > 0 {
            return true;
        }
        match self.spawn_worker() {
            Ok(started) => started,
            Err(error) => {
                log::warn!("pool {}: could not add a spare worker: {}", self.id, error);
                false
            }
        }
    }

    /// Leave the pool if more than `min_threads` workers are alive
    fn try_retire(&self) -> bool {
        let mut live = self.live_workers.load(Ordering::Acquire);
        loop {
            if live <= self.config.min_threads {
                return false;
            }
            match self.live_workers.compare_exchange_weak(
                live,
                live - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    fn worker_main(self: Arc<Self>) {
        loop {
            if let Some(queued) = self.dequeue() {
                self.dispatch(queued);
                continue;
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.idle_workers.fetch_add(1, Ordering::AcqRel);
            let signaled = self.work_available.wait_timeout(self.config.idle_timeout);
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);

            if !signaled && self.try_retire() {
                log::debug!("pool {}: idle worker retired", self.id);
                // Work queued while retiring may have counted on this worker
                if self.queued.load(Ordering::Acquire) > 0 {
                    self.grow();
                }
                return;
            }
        }

        self.live_workers.fetch_sub(1, Ordering::AcqRel);
        log::debug!("pool {}: worker exited", self.id);
    }

    fn timer_main(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            let (expired, next_due) = {
                let mut timers = self.timers.lock();
                let now = Instant::now();
                let split = timers.partition_point(|entry| entry.due <= now);
                let expired: Vec<TimerEntry> = timers.drain(..split).collect();
                (expired, timers.first().map(|entry| entry.due))
            };

            if !expired.is_empty() {
                for entry in expired {
                    entry.expire();
                }
                continue;
            }

            match next_due {
                Some(due) => {
                    self.timer_event.wait_until(due);
                }
                None => self.timer_event.wait(),
            }
        }
        log::debug!("pool {}: timer thread exited", self.id);
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("pool {}: shutting down", self.id);

        let live = self.live_workers.load(Ordering::Acquire);
        self.work_available
            .release_saturating(i32::try_from(live + 1).unwrap_or(i32::MAX));
        self.timer_event.set();

        let current = thread::current().id();
        let threads = core::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("pool {}: thread terminated abnormally", self.id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------------

    fn enqueue(self: &Arc<Self>, dispatch: Dispatch, options: CallbackOptions) {
        let queued = QueuedDispatch {
            dispatch,
            options,
            queued_at: Instant::now(),
        };

        self.queues[options.priority.index()].lock().push_back(queued);
        let pending = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        self.work_available.release_saturating(1);

        if pending > self.idle_workers.load(Ordering::Acquire) {
            self.grow();
        }
    }

    /// Queue a callback of `object`; the caller has counted it
    pub(crate) fn enqueue_object(
        self: &Arc<Self>,
        object: Arc<TpObject>,
        payload: Payload,
        options: CallbackOptions,
    ) {
        self.enqueue(Dispatch::Object { object, payload }, options);
    }

    /// Queue a plain callback
    pub(crate) fn submit(self: &Arc<Self>, callback: SimpleCallback, options: CallbackOptions) {
        self.enqueue(Dispatch::Simple { callback }, options);
    }

    fn dequeue(&self) -> Option<QueuedDispatch> {
        for queue in &self.queues {
            let queued = queue.lock().pop_front();
            if queued.is_some() {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                return queued;
            }
        }
        None
    }

    /// Drop every queued callback of `object_id` that has not started
    ///
    /// Returns the number removed.
    pub(crate) fn remove_queued(&self, object_id: u64) -> usize {
        let mut removed = Vec::new();

        for queue in &self.queues {
            let mut queue = queue.lock();
            if !queue.iter().any(|queued| queued.belongs_to(object_id)) {
                continue;
            }
            let mut kept = VecDeque::with_capacity(queue.len());
            for queued in queue.drain(..) {
                if queued.belongs_to(object_id) {
                    removed.push(queued);
                } else {
                    kept.push_back(queued);
                }
            }
            *queue = kept;
        }

        self.queued.fetch_sub(removed.len(), Ordering::AcqRel);
        // Dropped outside the queue locks
        removed.len()
    }

    fn dispatch(self: &Arc<Self>, queued: QueuedDispatch) {
        let QueuedDispatch {
            dispatch,
            options,
            queued_at,
        } = queued;

        if options.flags.contains(CallbackFlags::RUNS_LONG) {
            self.ensure_spare_worker();
        }

        let started_at = Instant::now();
        match dispatch {
            Dispatch::Object { object, payload } => {
                let context = DispatchContext {
                    pool: self,
                    object_id: object.id(),
                    options,
                    queued_at,
                    started_at,
                };
                object.invoke(&context, payload);
            }
            Dispatch::Simple { callback } => {
                let context = DispatchContext {
                    pool: self,
                    object_id: 0,
                    options,
                    queued_at,
                    started_at,
                };
                let instance = CallbackInstance::new(&context, None);
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&instance)
                }));
                if result.is_err() {
                    bugcheck!(codes::CALLBACK_RAISED_EXCEPTION, 0, ke_get_current_thread_id());
                }
                instance.complete();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    pub(crate) fn insert_timer(&self, entry: TimerEntry) {
        let earliest = {
            let mut timers = self.timers.lock();
            let position = timers.partition_point(|queued| queued.due <= entry.due);
            timers.insert(position, entry);
            position == 0
        };

        if earliest {
            self.timer_event.set();
        }
    }

    /// Remove the timer entry armed under `key`, if still pending
    pub(crate) fn cancel_timer_key(&self, key: u64) {
        let mut timers = self.timers.lock();
        if let Some(position) = timers.iter().position(|entry| entry.key == key) {
            timers.remove(position);
        }
    }
}

// ============================================================================
// Pool Handle
// ============================================================================

/// Shuts the pool down when the last handle goes away
struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Handle to a thread pool
#[derive(Clone)]
pub struct ThreadPool {
    handle: Arc<PoolHandle>,
}

impl ThreadPool {
    /// Create a pool and start its timer thread and `min_threads` workers
    pub fn new(config: ThreadPoolConfig) -> Result<Self> {
        let config = config.normalized();
        let pool = Self {
            handle: Arc::new(PoolHandle {
                shared: Arc::new(PoolShared::new(config)),
            }),
        };

        let shared = pool.shared();
        let timer_shared = shared.clone();
        shared.spawn_thread(format!("{}-timer", shared.config.thread_name), move || {
            timer_shared.timer_main()
        })?;

        for _ in 0..shared.config.min_threads {
            shared.spawn_worker()?;
        }

        log::info!(
            "pool {} created ({}..{} workers)",
            shared.id,
            shared.config.min_threads,
            shared.config.max_threads
        );
        Ok(pool)
    }

    /// The process-wide default pool
    pub fn system() -> &'static ThreadPool {
        SYSTEM_POOL.call_once(|| match ThreadPool::new(ThreadPoolConfig::default()) {
            Ok(pool) => pool,
            Err(error) => {
                log::error!("system thread pool: {}", error);
                bugcheck!(codes::THREAD_POOL_INITIALIZATION_FAILED, error.code())
            }
        })
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.handle.shared
    }

    pub fn id(&self) -> u64 {
        self.shared().id
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.shared().config
    }

    /// Workers currently alive
    pub fn worker_count(&self) -> usize {
        self.shared().live_workers.load(Ordering::Acquire)
    }

    /// Workers currently waiting for work
    pub fn idle_worker_count(&self) -> usize {
        self.shared().idle_workers.load(Ordering::Acquire)
    }

    /// Callbacks queued and not yet started
    pub fn queued_count(&self) -> usize {
        self.shared().queued.load(Ordering::Acquire)
    }

    /// Armed timers and wait timeouts
    pub fn pending_timer_count(&self) -> usize {
        self.shared().timers.lock().len()
    }

    /// True if both handles refer to the same pool
    pub fn ptr_eq(&self, other: &ThreadPool) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Environment binding new objects to this pool
    pub fn environment(&self) -> CallbackEnvironment {
        CallbackEnvironment::new().with_pool(self.clone())
    }

    // ------------------------------------------------------------------------
    // Convenience entry points
    // ------------------------------------------------------------------------

    /// Run `callback` once on this pool, without a work item
    pub fn submit_work<F>(&self, callback: F)
    where
        F: FnOnce(&CallbackInstance<'_>) + Send + 'static,
    {
        self.submit_work_with_options(CallbackOptions::new(), callback);
    }

    pub fn submit_work_with_options<F>(&self, options: CallbackOptions, callback: F)
    where
        F: FnOnce(&CallbackInstance<'_>) + Send + 'static,
    {
        self.shared().submit(Box::new(callback), options);
    }

    pub fn make_work_item<F>(&self, callback: F) -> Arc<WorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        WorkItem::new_in(&self.environment(), callback)
    }

    pub fn make_work_item_with_options<F>(&self, options: CallbackOptions, callback: F) -> Arc<WorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        WorkItem::new_in(&self.environment().with_options(options), callback)
    }

    pub fn make_timer_work_item<F>(&self, callback: F) -> Arc<TimerWorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        TimerWorkItem::new_in(&self.environment(), callback)
    }

    pub fn make_wait_work_item<F>(&self, callback: F) -> Arc<WaitWorkItem>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        WaitWorkItem::new_in(&self.environment(), callback)
    }

    pub fn make_io_handler<F>(&self, callback: F) -> Arc<IoHandler>
    where
        F: Fn(&CallbackInstance<'_>, IoCompletion) + Send + Sync + 'static,
    {
        IoHandler::new_in(&self.environment(), callback)
    }

    pub fn make_cleanup_group(&self) -> Arc<CleanupGroup> {
        CleanupGroup::new(self.clone())
    }

    /// Create a work item and post it
    pub fn post<F>(&self, callback: F) -> Arc<WorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let item = self.make_work_item(callback);
        item.post();
        item
    }

    /// Create a timer work item due after `delay`
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> Arc<TimerWorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let timer = self.make_timer_work_item(callback);
        timer.schedule(delay);
        timer
    }

    /// Create a timer work item due at `due`
    pub fn schedule_at<F>(&self, due: Instant, callback: F) -> Arc<TimerWorkItem>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        let timer = self.make_timer_work_item(callback);
        timer.schedule_at(due);
        timer
    }

    /// Create a wait work item waiting on `event`
    pub fn schedule_wait<F>(
        &self,
        event: &Arc<KEvent>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Arc<WaitWorkItem>
    where
        F: Fn(&CallbackInstance<'_>, WaitResult) + Send + Sync + 'static,
    {
        let wait = self.make_wait_work_item(callback);
        wait.schedule_wait(event, timeout);
        wait
    }
}

impl core::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.id())
            .field("workers", &self.worker_count())
            .field("idle", &self.idle_worker_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type TP_POOL = ThreadPool;
