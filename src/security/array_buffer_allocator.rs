//! ArrayBuffer allocator with a byte budget.
//!
//! V8's heap limits cover only the JavaScript heap, not ArrayBuffer backing
//! stores. This allocator keeps a running total of live backing-store bytes
//! and refuses allocations that would exceed `max_array_buffer_allocation`.
//!
//! ## How it works
//!
//! 1. V8 calls `allocate()` for `new ArrayBuffer(n)`, typed arrays, etc.
//! 2. The request is added to an atomic total.
//! 3. Over budget: the addition is rolled back and NULL is returned; V8
//!    raises `RangeError: Array buffer allocation failed`.
//! 4. `free()` subtracts the released size.
//!
//! Accounting is approximate: buffers transferred to another isolate are
//! still charged to the isolate that allocated them.

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use v8::{RustAllocatorVtable, UniqueRef};

pub struct ArrayBufferBudget {
    /// `usize::MAX` when unbounded.
    max: usize,
    allocated: AtomicUsize,
    /// Set the first time an allocation is refused.
    exhausted: Arc<AtomicBool>,
}

impl ArrayBufferBudget {
    /// `max_bytes == 0` means unbounded.
    pub fn new(max_bytes: usize, exhausted: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            max: if max_bytes == 0 { usize::MAX } else { max_bytes },
            allocated: AtomicUsize::new(0),
            exhausted,
        })
    }

    /// Convert to a V8 allocator for `CreateParams`.
    pub fn into_v8_allocator(self: Arc<Self>) -> UniqueRef<v8::Allocator> {
        let vtable: &'static RustAllocatorVtable<ArrayBufferBudget> = &RustAllocatorVtable {
            allocate,
            allocate_uninitialized,
            free,
            drop,
        };

        // SAFETY: the Arc is reclaimed by `drop` when V8 disposes the allocator.
        unsafe { v8::new_rust_allocator(Arc::into_raw(self), vtable) }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    fn reserve(&self, n: usize) -> bool {
        let previous = self.allocated.fetch_add(n, Ordering::SeqCst);

        match previous.checked_add(n) {
            Some(total) if total <= self.max => true,
            _ => {
                // roll back so a refused request does not consume budget
                self.allocated.fetch_sub(n, Ordering::SeqCst);
                self.exhausted.store(true, Ordering::SeqCst);
                tracing::warn!(
                    "ArrayBuffer allocation of {} bytes denied ({} of {} bytes in use)",
                    n,
                    previous,
                    self.max
                );
                false
            }
        }
    }
}

unsafe extern "C" fn allocate(budget: &ArrayBufferBudget, n: usize) -> *mut c_void {
    if !budget.reserve(n) {
        return std::ptr::null_mut();
    }

    Box::into_raw(vec![0u8; n].into_boxed_slice()) as *mut [u8] as *mut c_void
}

#[allow(clippy::uninit_vec)]
unsafe extern "C" fn allocate_uninitialized(budget: &ArrayBufferBudget, n: usize) -> *mut c_void {
    if !budget.reserve(n) {
        return std::ptr::null_mut();
    }

    let mut store = Vec::with_capacity(n);
    // SAFETY: capacity is n and V8 initializes the bytes before reading them
    unsafe { store.set_len(n) };

    Box::into_raw(store.into_boxed_slice()) as *mut [u8] as *mut c_void
}

unsafe extern "C" fn free(budget: &ArrayBufferBudget, data: *mut c_void, n: usize) {
    budget.allocated.fetch_sub(n, Ordering::SeqCst);
    // SAFETY: data came from allocate/allocate_uninitialized with size n
    let _ = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(data as *mut u8, n)) };
}

unsafe extern "C" fn drop(budget: *const ArrayBufferBudget) {
    // SAFETY: created via Arc::into_raw in into_v8_allocator
    let _ = unsafe { Arc::from_raw(budget) };
}
