//! Near-heap-limit backstop for the heap governor.
//!
//! The sampling governor ([`super::heap_watch`]) is the primary enforcement of
//! `max_heap_size`. This callback handles the case where V8 reaches its own
//! hard limit before a sample is taken.
//!
//! ## How it works
//!
//! 1. First call: the limit is raised once by `heap_expansion_multiplier` so a
//!    GC can make progress.
//! 2. Subsequent calls: the OOM latch is set and execution is terminated. Some
//!    headroom is returned so the termination can unwind instead of V8
//!    aborting the process.
//!
//! An OOM error handler is installed as well; it only logs, since V8 cannot
//! recover from allocation failures outside its managed heap.

use std::ffi::{c_char, c_void};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use v8::IsolateHandle;

/// State handed to V8 as the callback's `data` pointer.
///
/// Must outlive the isolate.
pub struct HeapLimitState {
    isolate_handle: IsolateHandle,
    out_of_memory: Arc<AtomicBool>,
    invocation_count: AtomicU32,
    expansion_multiplier: f64,
}

impl HeapLimitState {
    pub fn new(isolate_handle: IsolateHandle, out_of_memory: Arc<AtomicBool>, expansion_multiplier: f64) -> Self {
        Self {
            isolate_handle,
            out_of_memory,
            invocation_count: AtomicU32::new(0),
            expansion_multiplier,
        }
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocation_count.load(Ordering::SeqCst)
    }

    /// Compute the next limit for a callback invocation.
    fn next_limit(&self, current_heap_limit: usize) -> usize {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 && self.expansion_multiplier > 1.0 {
            let expanded = (current_heap_limit as f64 * self.expansion_multiplier) as usize;
            if expanded > current_heap_limit {
                tracing::warn!(
                    "Near heap limit: expanding from {} MB to {} MB",
                    current_heap_limit / (1024 * 1024),
                    expanded / (1024 * 1024)
                );
                return expanded;
            }
        }

        tracing::error!(
            "Heap limit exhausted after {} callbacks, terminating execution",
            count + 1
        );

        self.out_of_memory.store(true, Ordering::SeqCst);
        self.isolate_handle.terminate_execution();

        current_heap_limit + current_heap_limit / 2
    }
}

/// # Safety
///
/// `data` must point to a live `HeapLimitState` (see [`install_heap_limit_callback`]).
pub unsafe extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    initial_heap_limit: usize,
) -> usize {
    // SAFETY: data is the HeapLimitState registered with the isolate
    let state = unsafe { &*(data as *const HeapLimitState) };

    tracing::debug!(
        "Near heap limit callback (current: {} MB, initial: {} MB)",
        current_heap_limit / (1024 * 1024),
        initial_heap_limit / (1024 * 1024)
    );

    state.next_limit(current_heap_limit)
}

unsafe extern "C" fn oom_error_handler(location: *const c_char, details: &v8::OomDetails) {
    let location_str = if location.is_null() {
        "unknown"
    } else {
        // SAFETY: V8 passes a valid C string
        unsafe { std::ffi::CStr::from_ptr(location) }
            .to_str()
            .unwrap_or("invalid utf8")
    };

    let oom_type = if details.is_heap_oom {
        "JavaScript heap"
    } else {
        "process/external memory"
    };

    tracing::error!("V8 OOM at {}: {} out of memory", location_str, oom_type);
}

/// Install the backstop. Keep the returned box alive as long as the isolate.
pub fn install_heap_limit_callback(
    isolate: &mut v8::Isolate,
    out_of_memory: Arc<AtomicBool>,
    expansion_multiplier: f64,
) -> Box<HeapLimitState> {
    let state = Box::new(HeapLimitState::new(
        isolate.thread_safe_handle(),
        out_of_memory,
        expansion_multiplier,
    ));

    let state_ptr = &*state as *const HeapLimitState as *mut c_void;
    isolate.add_near_heap_limit_callback(near_heap_limit_callback, state_ptr);
    isolate.set_oom_error_handler(oom_error_handler);

    state
}
