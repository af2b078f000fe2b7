//! V8's own stack guard, pointed at the configured stack budget.
//!
//! The binding exposes the stack limit only through `CreateParams`, which is
//! fixed to the creating thread. Isolates here move between threads, so the
//! limit is set on every outermost execution scope through
//! `v8::Isolate::SetStackLimit`, linked directly from the V8 static library.

/// V8's default `--stack-size`, in bytes.
pub(crate) const DEFAULT_STACK_DEPTH: usize = 984 * 1024;

/// Message of the `RangeError` V8 throws when its stack guard trips.
pub(crate) const STACK_OVERFLOW_MESSAGE: &str = "Maximum call stack size exceeded";

#[cfg(all(unix, target_pointer_width = "64"))]
mod ffi {
    unsafe extern "C" {
        /// `void v8::Isolate::SetStackLimit(uintptr_t)`
        #[link_name = "_ZN2v87Isolate13SetStackLimitEm"]
        pub(super) fn isolate_set_stack_limit(isolate: v8::UnsafeRawIsolatePtr, stack_limit: usize);
    }
}

/// Set the lowest address V8 lets the stack of `isolate` grow to.
///
/// Returns false where the limit cannot be installed; the sampling stack
/// watcher is then the only guard.
pub(crate) fn set_stack_limit(isolate: &v8::Isolate, limit: usize) -> bool {
    #[cfg(all(unix, target_pointer_width = "64"))]
    {
        // SAFETY: the caller holds the Locker that entered `isolate` on this
        // thread, which is what SetStackLimit requires.
        unsafe { ffi::isolate_set_stack_limit(isolate.as_raw_isolate_ptr(), limit) };
        tracing::trace!("V8 stack limit set to {:#x}", limit);
        true
    }
    #[cfg(not(all(unix, target_pointer_width = "64")))]
    {
        let _ = (isolate, limit);
        false
    }
}
