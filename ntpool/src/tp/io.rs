//! I/O Completion Handlers
//!
//! An [`IoHandler`] runs its callback for every completed I/O request
//! reported through its [`IoCompletionPort`]. Many requests may be in
//! flight through one handler at once, so a handler has no posted/ready
//! cycle; it is only open or closed.
//!
//! Equivalent to NT's TP_IO.
//!
//! # Protocol
//!
//! 1. `start_io` right before issuing the asynchronous operation
//! 2. If the operation failed to go pending, `failed_start_io` (or let
//!    the [`IoGuard`] drop while armed)
//! 3. Otherwise `disarm` the guard; the operation's completion is later
//!    reported with [`IoCompletionPort::complete`]
//!
//! Each started I/O counts as outstanding work until its callback has
//! run, so `join` waits for every started request.
//!
//! # Usage
//! ```
//! use ntpool::tp::IoHandler;
//!
//! let handler = IoHandler::new(|_, completion| {
//!     assert_eq!(completion.result, 0);
//! });
//! let port = handler.port();
//!
//! let mut guard = handler.start_io();
//! std::thread::spawn(move || port.complete(Box::new(()), 0, 512));
//! guard.disarm();
//!
//! handler.join();
//! ```

use core::sync::atomic::{AtomicBool, Ordering};
use std::any::Any;
use std::sync::{Arc, Weak};

use super::environment::CallbackEnvironment;
use super::instance::CallbackInstance;
use super::object::{CallbackTarget, DispatchContext, IoCompletion, Payload, TpObject, TpObjectKind};
use crate::ex::rundown::Join;
use crate::ke::bugcheck::codes;
use crate::ke::thread::{ke_enter_object_callback, ke_get_current_thread_id, ke_is_in_object_callback};
use crate::{bugcheck, bugcheck_if};

type IoCallback = Box<dyn Fn(&CallbackInstance<'_>, IoCompletion) + Send + Sync + 'static>;

/// Callback side of a handler, kept alive by the handler itself
struct IoTarget {
    closed: AtomicBool,
    callback: IoCallback,
}

impl CallbackTarget for IoTarget {
    fn run(&self, context: &DispatchContext<'_>, payload: Payload) {
        let completion = match payload {
            Payload::Io(completion) => completion,
            _ => bugcheck!(codes::INVALID_WORK_QUEUE_ITEM, context.object_id),
        };

        // Several completions may run at once, so the mark is per thread
        let _scope = ke_enter_object_callback(context.object_id);
        let instance = CallbackInstance::new(context, None);
        (self.callback)(&instance, completion);
        instance.complete();
    }

    fn on_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Runs a callback for each completed I/O
pub struct IoHandler {
    object: Arc<TpObject>,
    target: Arc<IoTarget>,
}

impl IoHandler {
    /// Handler on the system pool
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>, IoCompletion) + Send + Sync + 'static,
    {
        Self::new_in(&CallbackEnvironment::new(), callback)
    }

    /// Handler bound to `environment`
    pub fn new_in<F>(environment: &CallbackEnvironment, callback: F) -> Arc<Self>
    where
        F: Fn(&CallbackInstance<'_>, IoCompletion) + Send + Sync + 'static,
    {
        let target = Arc::new(IoTarget {
            closed: AtomicBool::new(false),
            callback: Box::new(callback),
        });
        let weak = Arc::downgrade(&target);
        let weak: Weak<dyn CallbackTarget> = weak;
        let id = TpObject::allocate_id();

        Arc::new(Self {
            object: TpObject::new(id, TpObjectKind::Io, environment, weak),
            target,
        })
    }

    /// Account for an I/O about to be issued
    ///
    /// Starting I/O on a closed handler is a contract violation.
    #[must_use = "dropping the guard cancels the started I/O"]
    pub fn start_io(&self) -> IoGuard<'_> {
        self.internal_start_io();
        IoGuard {
            handler: Some(self),
        }
    }

    fn internal_start_io(&self) {
        bugcheck_if!(self.is_closed(), codes::IO_HANDLER_CLOSED, self.object.id());
        self.object.start_io();
    }

    /// The I/O accounted by `start_io` did not go pending
    pub fn failed_start_io(&self) {
        bugcheck_if!(self.is_closed(), codes::IO_HANDLER_CLOSED, self.object.id());
        self.object.cancel_io();
    }

    /// Where completions of this handler's I/O are reported
    pub fn port(&self) -> IoCompletionPort {
        IoCompletionPort {
            object: self.object.clone(),
        }
    }

    /// Started I/O not yet completed or cancelled
    pub fn pending_io_count(&self) -> usize {
        self.object.pending_io()
    }

    /// Wait until every started I/O has completed and its callback run
    ///
    /// Joining from inside this handler's own callback is a contract
    /// violation.
    pub fn join(&self) {
        self.check_not_self_join();
        if !self.is_closed() {
            self.object.wait_for_callbacks(false);
        }
    }

    fn check_not_self_join(&self) {
        bugcheck_if!(
            ke_is_in_object_callback(self.object.id()),
            codes::WORK_ITEM_SELF_JOIN,
            self.object.id(),
            ke_get_current_thread_id()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.target.closed.load(Ordering::Acquire)
    }
}

impl Join for IoHandler {
    fn join(&self) {
        IoHandler::join(self)
    }
}

impl Drop for IoHandler {
    fn drop(&mut self) {
        self.check_not_self_join();
        if !self.is_closed() {
            self.object.wait_for_callbacks(false);
            self.object.close();
        }
    }
}

impl core::fmt::Debug for IoHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoHandler")
            .field("id", &self.object.id())
            .field("pending_io", &self.object.pending_io())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reports completed I/O to a handler
///
/// Cloneable and sendable, so it can travel with the request. Each
/// completion must match exactly one `start_io`.
#[derive(Clone)]
pub struct IoCompletionPort {
    object: Arc<TpObject>,
}

impl IoCompletionPort {
    /// Report one completed request; the handler's callback runs on the pool
    pub fn complete(&self, request: Box<dyn Any + Send>, result: u32, bytes_transferred: usize) {
        self.object.complete_io(IoCompletion {
            request,
            result,
            bytes_transferred,
        });
    }
}

impl core::fmt::Debug for IoCompletionPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoCompletionPort")
            .field("handler", &self.object.id())
            .finish()
    }
}

/// Cancels a started I/O unless disarmed
pub struct IoGuard<'a> {
    handler: Option<&'a IoHandler>,
}

impl<'a> IoGuard<'a> {
    /// A guard with no I/O attached
    pub fn empty() -> Self {
        Self { handler: None }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.handler.is_some()
    }

    /// The operation went pending; its completion will be reported
    pub fn disarm(&mut self) {
        self.handler = None;
    }

    /// The operation did not go pending
    pub fn failed_start_io(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.failed_start_io();
        }
    }
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.failed_start_io();
    }
}

// NT API compatibility type alias
#[allow(non_camel_case_types)]
pub type TP_IO = IoHandler;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tp::pool::{ThreadPool, ThreadPoolConfig};
    use core::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_pool() -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig::default().with_threads(1, 4)).unwrap()
    }

    #[test]
    fn test_completions_reach_callback() {
        let pool = test_pool();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handler = pool.make_io_handler(move |_, completion| {
            let tag = completion.request.downcast::<u32>().map(|tag| *tag).unwrap_or(0);
            sink.lock().unwrap().push((tag, completion.bytes_transferred));
        });

        let issuers: Vec<_> = (1..=8u32)
            .map(|tag| {
                let mut guard = handler.start_io();
                let port = handler.port();
                let issuer = std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    port.complete(Box::new(tag), 0, tag as usize * 10);
                });
                guard.disarm();
                issuer
            })
            .collect();

        handler.join();
        assert_eq!(handler.pending_io_count(), 0);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen.len(), 8);
        assert_eq!(seen[0], (1, 10));
        assert_eq!(seen[7], (8, 80));

        for issuer in issuers {
            issuer.join().unwrap();
        }
    }

    #[test]
    fn test_guard_cancels_unissued_io() {
        let pool = test_pool();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handler = pool.make_io_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        {
            let guard = handler.start_io();
            assert!(guard.is_armed());
            assert_eq!(handler.pending_io_count(), 1);
        }
        assert_eq!(handler.pending_io_count(), 0);

        let mut guard = handler.start_io();
        guard.failed_start_io();
        assert!(!guard.is_armed());

        // Nothing outstanding, so join returns at once
        handler.join();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_waits_for_started_io() {
        let pool = test_pool();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handler = pool.make_io_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut guard = handler.start_io();
        guard.disarm();
        drop(guard);

        let port = handler.port();
        let issuer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            port.complete(Box::new(()), 0, 0);
        });

        drop(handler);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        issuer.join().unwrap();
    }
}
