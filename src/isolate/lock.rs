//! Re-entrant isolate lock and the call-with-lock queue.
//!
//! ## Lock
//!
//! ```text
//! with_lock (outermost on this thread)        with_lock (nested)
//! ├── ReentrantMutex::lock                     ├── ReentrantMutex::lock (re-entry)
//! ├── v8::Locker::new  (enters the isolate)    ├── reuse entered isolate pointer
//! ├── process deferred handle drops            ├── drain allow_nesting entries
//! ├── drain queue                              ├── f(isolate)
//! ├── f(isolate)                               └── drain allow_nesting entries
//! ├── drain queue + microtask checkpoint
//! └── drop Locker, unlock
//! ```
//!
//! ## Queue
//!
//! Foreign threads never block on the isolate while holding the data mutex:
//! they push an entry and, if the isolate mutex happens to be free, take it
//! just long enough to drain. Otherwise the current holder drains the entry on
//! its next scope entry or exit. Entries run in arrival order.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::{Condvar, Mutex};

use super::IsolateInner;
use crate::error::{ENGINE_DESTROYED, Error};

/// Work submitted to run under the isolate lock.
pub type LockCallback = Box<dyn FnOnce(&mut v8::Isolate) + Send + 'static>;

/// Why the inspector message loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    AwaitingDebugger,
    PausedInDebugger,
}

/// Why the inspector message loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLoopExit {
    /// The inspector resumed execution.
    Resumed,
    /// `cancel_await_debugger` was called.
    Canceled,
    /// `terminate_execution` was called.
    Terminated,
}

struct QueueEntry {
    allow_nesting: bool,
    callback: LockCallback,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    pause_reason: Option<PauseReason>,
    exit: Option<MessageLoopExit>,
}

/// The data-mutex side of the isolate: queue plus message-loop state.
#[derive(Default)]
pub(crate) struct CallWithLockQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

pub(crate) enum LoopStep {
    Run(LockCallback),
    Exit(MessageLoopExit),
}

impl CallWithLockQueue {
    pub(crate) fn push(&self, allow_nesting: bool, callback: LockCallback) {
        let mut state = self.state.lock();
        state.entries.push_back(QueueEntry {
            allow_nesting,
            callback,
        });
        self.ready.notify_all();
    }

    /// Next runnable entry. Nested drains skip entries that require the outermost scope.
    fn pop(&self, nested: bool) -> Option<LockCallback> {
        let mut state = self.state.lock();
        if nested {
            let index = state.entries.iter().position(|e| e.allow_nesting)?;
            state.entries.remove(index).map(|e| e.callback)
        } else {
            state.entries.pop_front().map(|e| e.callback)
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Remove every pending entry without running it.
    pub(crate) fn take_all(&self) -> Vec<LockCallback> {
        let mut state = self.state.lock();
        state.entries.drain(..).map(|e| e.callback).collect()
    }

    pub(crate) fn pause_reason(&self) -> Option<PauseReason> {
        self.state.lock().pause_reason
    }

    /// Enter a message loop; returns the reason of any enclosing loop.
    pub(crate) fn begin_pause(&self, reason: PauseReason) -> Option<PauseReason> {
        let mut state = self.state.lock();
        state.exit = None;
        state.pause_reason.replace(reason)
    }

    pub(crate) fn end_pause(&self, previous: Option<PauseReason>) {
        let mut state = self.state.lock();
        state.pause_reason = previous;
        state.exit = None;
    }

    /// Ask a running message loop to exit. `false` if no loop is running.
    pub(crate) fn request_exit(&self, exit: MessageLoopExit) -> bool {
        let mut state = self.state.lock();
        if state.pause_reason.is_none() {
            return false;
        }
        state.exit = Some(exit);
        self.ready.notify_all();
        true
    }

    /// Block until there is work or an exit request.
    pub(crate) fn next_step(&self) -> LoopStep {
        let mut state = self.state.lock();
        loop {
            if let Some(exit) = state.exit.take() {
                return LoopStep::Exit(exit);
            }
            if let Some(entry) = state.entries.pop_front() {
                return LoopStep::Run(entry.callback);
            }
            self.ready.wait(&mut state);
        }
    }
}

/// Interior state only touched by the thread that owns the isolate lock.
pub(crate) struct LockedCell<T>(UnsafeCell<T>);

// SAFETY: all access goes through `get`, whose contract requires the
// isolate lock; the lock serializes threads.
unsafe impl<T: Send> Sync for LockedCell<T> {}
unsafe impl<T: Send> Send for LockedCell<T> {}

impl<T> LockedCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    ///
    /// The caller holds the isolate lock and does not keep the reference
    /// across any call that can re-enter this cell.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get(&self) -> &mut T {
        // SAFETY: upheld by caller
        unsafe { &mut *self.0.get() }
    }

    /// # Safety
    ///
    /// The caller holds the isolate lock and nothing mutates the cell while
    /// the reference lives.
    pub(crate) unsafe fn get_ref(&self) -> &T {
        // SAFETY: upheld by caller
        unsafe { &*self.0.get() }
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

/// Restores the nesting depth and entered pointer even if `f` panics.
struct DepthGuard<'a> {
    inner: &'a IsolateInner,
    outermost: bool,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.inner.depth.fetch_sub(1, Ordering::SeqCst);
        if self.outermost {
            self.inner.entered.store(std::ptr::null_mut(), Ordering::SeqCst);
        }
    }
}

impl IsolateInner {
    /// Run `f` with the isolate locked and entered on this thread.
    ///
    /// Re-entrant: a nested call on the thread that already holds the lock
    /// re-uses the entered isolate.
    pub(crate) fn with_lock<R>(&self, f: impl FnOnce(&mut v8::Isolate) -> R) -> R {
        let _guard = self.mutex.lock();

        if self.depth.load(Ordering::SeqCst) > 0 {
            let isolate_ptr = self.entered.load(Ordering::SeqCst);
            self.depth.fetch_add(1, Ordering::SeqCst);
            let _depth = DepthGuard {
                inner: self,
                outermost: false,
            };

            // SAFETY: a non-zero depth means an outer frame on this thread
            // (the mutex is held) owns a live Locker for this pointer.
            let isolate = unsafe { &mut *isolate_ptr };
            self.drain_queue(isolate, true);
            let result = f(isolate);
            self.drain_queue(isolate, true);
            return result;
        }

        // SAFETY: mutex held, depth zero: nothing else references the cell.
        // The isolate is only disposed by IsolateInner's Drop.
        let unentered: &mut v8::UnenteredIsolate = unsafe { self.v8_isolate.get() };

        let mut locker = v8::Locker::new(unentered);
        let isolate: &mut v8::Isolate = &mut locker;
        self.entered.store(isolate as *mut v8::Isolate, Ordering::SeqCst);
        self.depth.fetch_add(1, Ordering::SeqCst);
        let _depth = DepthGuard {
            inner: self,
            outermost: true,
        };

        self.deferred.process_all();
        self.drain_queue(isolate, false);

        let result = f(isolate);

        self.settle(isolate);
        result
    }

    /// Drain the queue and microtasks until both are quiet.
    fn settle(&self, isolate: &mut v8::Isolate) {
        loop {
            self.drain_queue(isolate, false);
            if !self.out_of_memory() {
                isolate.perform_microtask_checkpoint();
            }
            crate::platform::pump_message_loop(isolate);
            if self.queue.len() == 0 {
                break;
            }
        }
        self.deferred.process_all();
    }

    fn drain_queue(&self, isolate: &mut v8::Isolate, nested: bool) {
        while let Some(callback) = self.queue.pop(nested) {
            callback(isolate);
        }
    }

    /// Nesting depth of the isolate lock on the owning thread (0 when unlocked).
    pub(crate) fn lock_depth(&self) -> usize {
        if self.mutex.is_owned_by_current_thread() {
            self.depth.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    pub(crate) fn is_locked_by_current_thread(&self) -> bool {
        self.mutex.is_owned_by_current_thread() && self.depth.load(Ordering::SeqCst) > 0
    }

    /// Queue `callback`; run it now if the isolate is free.
    pub(crate) fn call_with_lock(self: &Arc<Self>, allow_nesting: bool, callback: LockCallback) {
        self.queue.push(allow_nesting, callback);

        // `try_lock` also succeeds for the owning thread, where the nested
        // entry drains only `allow_nesting` entries.
        if let Some(guard) = self.mutex.try_lock() {
            self.with_lock(|_| {});
            drop(guard);
            return;
        }

        // The holder may already be past its final drain.
        let weak = Arc::downgrade(self);
        self.env.queue_native_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.with_lock(|_| {});
            }
        }));
    }

    /// Run `f` under the lock and wait for its result.
    pub(crate) fn call_with_lock_sync<R: Send + 'static>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut v8::Isolate) -> R + Send + 'static,
    ) -> Result<R, Error> {
        if self.is_locked_by_current_thread() {
            return Ok(self.with_lock(f));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.queue.push(
            true,
            Box::new(move |isolate| {
                let _ = tx.send(f(isolate));
            }),
        );
        loop {
            // Either we drain it ourselves or the current holder does.
            if let Some(guard) = self.mutex.try_lock() {
                self.with_lock(|_| {});
                drop(guard);
            }
            match rx.recv_timeout(std::time::Duration::from_millis(5)) {
                Ok(result) => return Ok(result),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                // the entry was dropped without producing a result
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::EntityDisposed(ENGINE_DESTROYED));
                }
            }
        }
    }

    /// Run the inspector message loop until an exit is requested.
    ///
    /// Called with the lock held, from inside a V8 callback. Every queued
    /// entry is eligible here: the paused thread is the only one that can
    /// service the isolate.
    pub(crate) fn run_message_loop(&self, reason: PauseReason) -> MessageLoopExit {
        let previous = self.queue.begin_pause(reason);
        self.execution.enter_pause(reason);
        tracing::debug!("Message loop running ({:?})", reason);

        let exit = loop {
            match self.queue.next_step() {
                LoopStep::Exit(exit) => break exit,
                LoopStep::Run(callback) => {
                    let isolate_ptr = self.entered.load(Ordering::SeqCst);
                    // SAFETY: the loop only runs on the lock-owning thread
                    // inside an outer with_lock frame.
                    callback(unsafe { &mut *isolate_ptr });
                }
            }
        };

        self.queue.end_pause(previous);
        self.execution.leave_pause(previous);
        tracing::debug!("Message loop exited ({:?})", exit);
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn nested_pop_skips_non_nesting_entries() {
        let queue = CallWithLockQueue::default();
        let log = Arc::new(StdMutex::new(Vec::new()));

        for (i, nesting) in [(1, false), (2, true), (3, true)] {
            let log = log.clone();
            queue.push(nesting, Box::new(move |_| log.lock().unwrap().push(i)));
        }

        assert!(queue.pop(true).is_some());
        assert!(queue.pop(true).is_some());
        assert!(queue.pop(true).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.pop(false).is_some());
    }

    #[test]
    fn exit_requests_need_a_running_loop() {
        let queue = CallWithLockQueue::default();
        assert!(!queue.request_exit(MessageLoopExit::Canceled));

        let previous = queue.begin_pause(PauseReason::AwaitingDebugger);
        assert_eq!(previous, None);
        assert!(queue.request_exit(MessageLoopExit::Canceled));
        assert!(matches!(queue.next_step(), LoopStep::Exit(MessageLoopExit::Canceled)));

        queue.end_pause(previous);
        assert_eq!(queue.pause_reason(), None);
    }

    #[test]
    fn message_loop_wakes_for_foreign_exit() {
        let queue = Arc::new(CallWithLockQueue::default());
        queue.begin_pause(PauseReason::PausedInDebugger);

        let remote = queue.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            remote.request_exit(MessageLoopExit::Terminated);
        });

        assert!(matches!(queue.next_step(), LoopStep::Exit(MessageLoopExit::Terminated)));
        t.join().unwrap();
    }
}
