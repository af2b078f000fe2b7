//! Sampling heap governor and stack watcher.
//!
//! ## How it works
//!
//! A [`NativeCallbackTimer`] fires every `heap_size_sample_interval` on the
//! shared timer runtime. It does not touch V8 directly: it asks V8 for an
//! interrupt, and the interrupt callback then runs on whichever thread is
//! executing script, at the next safepoint, with the isolate locked. There it
//! reads `used_heap_size` and the current native stack depth.
//!
//! A sample that finds the heap over budget latches the isolate out of memory
//! and terminates execution. An idle isolate picks the interrupt up the next
//! time script runs, and every entry checks the latch anyway.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use crate::callbacks::NativeCallbackTimer;
use crate::error::Error;
use crate::isolate::IsolateInner;

pub(crate) struct HeapWatch {
    _timer: NativeCallbackTimer,
}

impl HeapWatch {
    pub(crate) fn start(isolate: &Arc<IsolateInner>, interval: Duration) -> Result<Self, Error> {
        let handle = isolate.handle.clone();
        // Raw pointer: the interrupt can only be delivered while the V8
        // isolate exists, and the isolate is disposed by IsolateInner's Drop
        // after this timer has been stopped.
        let data = Arc::as_ptr(isolate) as usize;

        let timer = NativeCallbackTimer::new(Some(interval), Some(interval), move || {
            handle.request_interrupt(sample_interrupt, data as *mut c_void);
        })?;

        tracing::debug!("Heap watch started ({:?} interval)", interval);
        Ok(Self { _timer: timer })
    }
}

/// Runs on the isolate thread at a safepoint.
unsafe extern "C" fn sample_interrupt(isolate: &mut v8::Isolate, data: *mut c_void) {
    // SAFETY: see HeapWatch::start
    let inner = unsafe { &*(data as *const IsolateInner) };
    inner.sample(isolate);
}

/// Used heap bytes right now.
pub(crate) fn used_heap_size(isolate: &mut v8::Isolate) -> usize {
    let mut stats = v8::HeapStatistics::default();
    isolate.get_heap_statistics(&mut stats);
    stats.used_heap_size()
}

/// Approximate current native stack position.
#[inline(never)]
pub(crate) fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}
