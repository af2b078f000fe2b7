//! Deferred destruction of V8 handles released off the isolate thread.
//!
//! ## Problem
//!
//! A `v8::Global` must be reset while its isolate is locked, but holders
//! ([`crate::V8Object`], [`crate::ScriptHolder`]) are owned by the host and may
//! be dropped from any thread at any time.
//!
//! ## Solution
//!
//! When a holder is dropped by a thread that does not own the isolate lock the
//! handle is moved into this queue. The queue is drained each time the lock is
//! taken at the outermost level, and once more during isolate teardown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A type-erased `v8::Global<T>` awaiting destruction.
pub struct DeferredHandle {
    ptr: *mut (),
    drop_fn: fn(*mut ()),
}

// SAFETY: the pointee is only dereferenced by `drop_fn`, which runs under the
// isolate lock when the queue is drained.
unsafe impl Send for DeferredHandle {}

impl DeferredHandle {
    pub fn new<T: 'static>(handle: v8::Global<T>) -> Self {
        let ptr = Box::into_raw(Box::new(handle)) as *mut ();

        Self {
            ptr,
            drop_fn: |ptr| {
                // SAFETY: ptr was created from Box::into_raw of a v8::Global<T>
                let _ = unsafe { Box::from_raw(ptr as *mut v8::Global<T>) };
            },
        }
    }
}

impl Drop for DeferredHandle {
    fn drop(&mut self) {
        (self.drop_fn)(self.ptr);
    }
}

/// Per-isolate queue of handles to reset under the lock.
#[derive(Default)]
pub struct DeferredDestructionQueue {
    queue: Mutex<VecDeque<DeferredHandle>>,
    // Lock-free fast path for the common empty case.
    pending: AtomicUsize,
}

impl DeferredDestructionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `handle`; callable from any thread.
    pub fn defer<T: 'static>(&self, handle: v8::Global<T>) {
        self.queue.lock().push_back(DeferredHandle::new(handle));
        let pending = self.pending.fetch_add(1, Ordering::Release) + 1;

        tracing::trace!("Deferred V8 handle destruction (pending: {})", pending);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset every queued handle. Caller must hold the isolate lock.
    pub fn process_all(&self) -> usize {
        if self.is_empty() {
            return 0;
        }

        let handles = std::mem::take(&mut *self.queue.lock());
        let count = handles.len();
        self.pending.fetch_sub(count, Ordering::Release);

        // Dropped outside the queue mutex: resetting a Global never re-enters
        // the queue, but a finalizer scheduled by it might.
        drop(handles);

        if count > 0 {
            tracing::trace!("Processed {} deferred handle destructions", count);
        }
        count
    }
}

impl std::fmt::Debug for DeferredDestructionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDestructionQueue")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_processes_nothing() {
        let queue = DeferredDestructionQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.process_all(), 0);
    }

    #[test]
    fn handles_are_reset_on_process() {
        crate::platform::initialize(Default::default());

        let mut isolate = v8::Isolate::new(Default::default());
        let queue = DeferredDestructionQueue::new();

        {
            let scope = std::pin::pin!(v8::HandleScope::new(&mut isolate));
            let scope = scope.init();
            for i in 0..3 {
                let n = v8::Number::new(&scope, i as f64);
                queue.defer(v8::Global::new(&scope, n));
            }
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.process_all(), 3);
        assert!(queue.is_empty());
    }
}
