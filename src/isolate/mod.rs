//! The isolate: one V8 heap plus everything that governs access to it.
//!
//! ## Architecture
//!
//! ```text
//! V8Isolate (Clone, Send + Sync)
//!   └── Arc<IsolateInner>
//!         ├── ReentrantMutex ─────────── guards every V8 call (see `lock`)
//!         ├── UnenteredIsolate ───────── entered via v8::Locker per outermost entry
//!         ├── CallWithLockQueue ──────── foreign-thread submissions, message-loop state
//!         ├── ExecutionTracker ───────── scopes, state machine, termination
//!         ├── ScriptCache (lru) ──────── compiled scripts by (unique id, digest)
//!         ├── DeferredDestructionQueue ─ Globals dropped off-lock
//!         ├── DebugState ─────────────── inspector, debug agent, CPU profiles
//!         ├── HeapWatch ──────────────── sampling timer (heap + stack)
//!         └── HeapLimitState ─────────── near-heap-limit backstop (outlives V8)
//! ```
//!
//! ## Teardown
//!
//! Contexts hold an `Arc` to their isolate, so the inner state only drops
//! once every context is gone. `Drop` stops the heap watch, takes the lock,
//! releases every V8 handle the isolate still owns, and disposes the raw
//! isolate last.

mod execution;
mod lock;
mod script_cache;

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};

pub use execution::ExecutionState;
pub(crate) use lock::LockedCell;
pub use lock::{LockCallback, MessageLoopExit, PauseReason};
pub(crate) use script_cache::{CachedScript, ScriptCache};

use crate::config::{ContextOptions, IsolateOptions};
use crate::context::{ContextInner, V8Context};
use crate::debug::DebugState;
use crate::error::Error;
use crate::gc::DeferredDestructionQueue;
use crate::host::{DefaultHostEnvironment, HostEnvironment};
use crate::security::heap_limit::install_heap_limit_callback;
use crate::security::heap_watch::HeapWatch;
use crate::security::{ArrayBufferBudget, HeapLimitState};
use execution::ExecutionTracker;
use lock::CallWithLockQueue;

/// Smallest hard V8 heap limit installed under the sampling governor.
const MIN_HARD_HEAP_LIMIT: usize = 16 * 1024 * 1024;

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a V8 isolate. Cheap to clone; usable from any thread.
#[derive(Clone)]
pub struct V8Isolate {
    pub(crate) inner: Arc<IsolateInner>,
}

struct HeapWatchSlot {
    interval: Duration,
    watch: Option<HeapWatch>,
}

pub(crate) struct IsolateInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) options: IsolateOptions,
    pub(crate) env: Arc<dyn HostEnvironment>,
    pub(crate) handle: v8::IsolateHandle,

    mutex: ReentrantMutex<()>,
    v8_isolate: LockedCell<ManuallyDrop<v8::UnenteredIsolate>>,
    /// The isolate as entered by the outermost Locker; null when unlocked.
    entered: AtomicPtr<v8::Isolate>,
    depth: AtomicUsize,

    pub(crate) queue: CallWithLockQueue,
    pub(crate) execution: ExecutionTracker,
    pub(crate) deferred: DeferredDestructionQueue,
    pub(crate) script_cache: LockedCell<ScriptCache>,
    pub(crate) debug: LockedCell<DebugState>,

    out_of_memory: Arc<AtomicBool>,
    pub(crate) max_heap_size: AtomicUsize,
    pub(crate) max_stack_usage: AtomicUsize,
    pub(crate) cpu_profile_sample_interval: AtomicU32,
    heap_watch: Mutex<HeapWatchSlot>,

    pub(crate) contexts: Mutex<Vec<Weak<ContextInner>>>,
    pub(crate) script_count: AtomicUsize,
    pub(crate) module_count: AtomicUsize,

    array_buffer_budget: Arc<ArrayBufferBudget>,
    array_buffer_exhausted: Arc<AtomicBool>,
    /// Registered with V8 as callback data; dropped after the isolate.
    _heap_limit: Box<HeapLimitState>,
}

impl IsolateInner {
    pub(crate) fn out_of_memory(&self) -> bool {
        self.out_of_memory.load(Ordering::SeqCst)
    }

    /// Fails with `OutOfMemory` once the latch is set.
    pub(crate) fn check_alive(&self) -> Result<(), Error> {
        if self.out_of_memory() {
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    pub(crate) fn live_contexts(&self) -> Vec<Arc<ContextInner>> {
        let mut contexts = self.contexts.lock();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.iter().filter_map(Weak::upgrade).collect()
    }

    fn restart_heap_watch(self: &Arc<Self>) -> Result<(), Error> {
        let mut slot = self.heap_watch.lock();
        let wanted = self.max_heap_size.load(Ordering::SeqCst) > 0
            || self.max_stack_usage.load(Ordering::SeqCst) > 0;

        slot.watch = None;
        if wanted {
            slot.watch = Some(HeapWatch::start(self, slot.interval)?);
        }
        Ok(())
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        tracing::debug!("Disposing isolate {} ({})", self.id, self.name);

        self.heap_watch.get_mut().watch = None;

        let _guard = self.mutex.lock();
        {
            // SAFETY: the mutex is held and no Locker is alive: the last
            // strong reference is gone, so no with_lock frame can exist.
            let unentered: &mut v8::UnenteredIsolate = unsafe { self.v8_isolate.get() };
            let mut locker = v8::Locker::new(unentered);
            let isolate: &mut v8::Isolate = &mut locker;

            // Queued work may own V8 handles.
            drop(self.queue.take_all());

            // SAFETY: lock held (above)
            unsafe { self.debug.get() }.shutdown();
            unsafe { self.script_cache.get() }.clear();
            self.deferred.process_all();

            isolate.low_memory_notification();
        }

        // SAFETY: disposed exactly once, after every handle was released and
        // with no Locker alive.
        unsafe { ManuallyDrop::drop(self.v8_isolate.get()) };
    }
}

/// Counters reported by [`V8Isolate::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolateStatistics {
    pub script_count: usize,
    pub script_cache_size: usize,
    pub module_count: usize,
    pub context_count: usize,
    pub cpu_profile_count: usize,
}

impl V8Isolate {
    pub fn new(options: IsolateOptions, env: Arc<dyn HostEnvironment>) -> Result<Self, Error> {
        options.validate()?;
        crate::platform::initialize(env.global_flags());

        let out_of_memory = Arc::new(AtomicBool::new(false));
        let array_buffer_exhausted = Arc::new(AtomicBool::new(false));
        let array_buffer_budget =
            ArrayBufferBudget::new(options.max_array_buffer_allocation, array_buffer_exhausted.clone());

        let mut params = v8::CreateParams::default().array_buffer_allocator(array_buffer_budget.clone().into_v8_allocator());

        // The sampling governor enforces max_heap_size; V8's own limit is a
        // backstop above it.
        if options.max_heap_size > 0 {
            let hard_limit = (options.max_heap_size.saturating_mul(2)).max(MIN_HARD_HEAP_LIMIT);
            params = params.heap_limits(options.initial_heap_size.min(hard_limit), hard_limit);
        }

        let mut unentered = v8::Isolate::new_unentered(params);

        let (handle, heap_limit) = {
            let mut locker = v8::Locker::new(&mut unentered);
            let isolate: &mut v8::Isolate = &mut locker;

            isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
            isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 16);
            isolate.set_host_import_module_dynamically_callback(crate::module_loader::dynamic_import_callback);
            isolate.set_host_initialize_import_meta_object_callback(crate::module_loader::import_meta_callback);

            let heap_limit =
                install_heap_limit_callback(isolate, out_of_memory.clone(), options.heap_expansion_multiplier);

            (isolate.thread_safe_handle(), heap_limit)
        };

        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        let script_cache = ScriptCache::new(env.max_script_cache_size());

        let inner = Arc::new(IsolateInner {
            id,
            name: options.name.clone(),
            handle,
            mutex: ReentrantMutex::new(()),
            v8_isolate: LockedCell::new(ManuallyDrop::new(unentered)),
            entered: AtomicPtr::new(std::ptr::null_mut()),
            depth: AtomicUsize::new(0),
            queue: CallWithLockQueue::default(),
            execution: ExecutionTracker::default(),
            deferred: DeferredDestructionQueue::new(),
            script_cache: LockedCell::new(script_cache),
            debug: LockedCell::new(DebugState::default()),
            out_of_memory,
            max_heap_size: AtomicUsize::new(options.max_heap_size),
            max_stack_usage: AtomicUsize::new(options.max_stack_usage),
            cpu_profile_sample_interval: AtomicU32::new(options.cpu_profile_sample_interval),
            heap_watch: Mutex::new(HeapWatchSlot {
                interval: options.heap_size_sample_interval,
                watch: None,
            }),
            contexts: Mutex::new(Vec::new()),
            script_count: AtomicUsize::new(0),
            module_count: AtomicUsize::new(0),
            array_buffer_budget,
            array_buffer_exhausted,
            _heap_limit: heap_limit,
            options,
            env,
        });

        inner.restart_heap_watch()?;

        tracing::debug!("Created isolate {} ({})", inner.id, inner.name);
        Ok(Self { inner })
    }

    /// Isolate with default options and no host environment.
    pub fn with_defaults() -> Result<Self, Error> {
        Self::new(IsolateOptions::default(), Arc::new(DefaultHostEnvironment))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &IsolateOptions {
        &self.inner.options
    }

    pub fn create_context(&self, options: ContextOptions) -> Result<V8Context, Error> {
        V8Context::new(&self.inner, options)
    }

    /// Queue `callback` to run under the isolate lock; returns immediately.
    ///
    /// With `allow_nesting` the callback may also run inside a nested scope,
    /// e.g. while script is executing or paused in the debugger.
    pub fn call_with_lock<F>(&self, allow_nesting: bool, callback: F)
    where
        F: FnOnce(&mut v8::Isolate) + Send + 'static,
    {
        self.inner.call_with_lock(allow_nesting, Box::new(callback));
    }

    /// Run `callback` under the isolate lock and return its result.
    pub fn call_with_lock_sync<F, R>(&self, callback: F) -> Result<R, Error>
    where
        F: FnOnce(&mut v8::Isolate) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.call_with_lock_sync(callback)
    }

    /// How deeply the calling thread has entered this isolate (0 if not at all).
    pub fn lock_depth(&self) -> usize {
        self.inner.lock_depth()
    }

    /// Run `callback` on the thread executing script, at the next safepoint.
    ///
    /// Returns `false` if the isolate can no longer accept interrupts.
    pub fn request_interrupt<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&mut v8::Isolate) + Send + 'static,
    {
        let boxed: Box<LockCallback> = Box::new(Box::new(callback));
        let data = Box::into_raw(boxed) as *mut c_void;
        let accepted = self.inner.handle.request_interrupt(run_interrupt, data);
        if !accepted {
            // SAFETY: V8 refused the request and never saw the pointer.
            drop(unsafe { Box::from_raw(data as *mut LockCallback) });
        }
        accepted
    }

    /// Cooperatively stop running script. Safe from any thread.
    pub fn interrupt(&self) {
        self.inner.terminate_execution(false);
    }

    pub fn cancel_interrupt(&self) {
        self.inner.cancel_terminate_execution();
    }

    pub fn terminate_execution(&self, force: bool) {
        self.inner.terminate_execution(force);
    }

    pub fn cancel_terminate_execution(&self) {
        self.inner.cancel_terminate_execution();
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.inner.is_execution_terminating()
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.inner.execution.state()
    }

    /// `true` once the heap governor has latched; every later call fails.
    pub fn is_out_of_memory(&self) -> bool {
        self.inner.out_of_memory()
    }

    pub fn max_heap_size(&self) -> usize {
        self.inner.max_heap_size.load(Ordering::SeqCst)
    }

    /// Change the governor threshold. `0` turns sampling off.
    pub fn set_max_heap_size(&self, bytes: usize) -> Result<(), Error> {
        self.inner.max_heap_size.store(bytes, Ordering::SeqCst);
        self.inner.restart_heap_watch()
    }

    pub fn heap_size_sample_interval(&self) -> Duration {
        self.inner.heap_watch.lock().interval
    }

    pub fn set_heap_size_sample_interval(&self, interval: Duration) -> Result<(), Error> {
        if interval.is_zero() {
            return Err(Error::Config("heap_size_sample_interval must be non-zero".into()));
        }
        self.inner.heap_watch.lock().interval = interval;
        self.inner.restart_heap_watch()
    }

    pub fn max_stack_usage(&self) -> usize {
        self.inner.max_stack_usage.load(Ordering::SeqCst)
    }

    pub fn set_max_stack_usage(&self, bytes: usize) -> Result<(), Error> {
        self.inner.max_stack_usage.store(bytes, Ordering::SeqCst);
        self.inner.restart_heap_watch()
    }

    /// Bytes currently held by ArrayBuffer backing stores.
    pub fn array_buffer_allocated(&self) -> usize {
        self.inner.array_buffer_budget.allocated()
    }

    /// `true` once an ArrayBuffer allocation has been refused.
    pub fn array_buffer_budget_exhausted(&self) -> bool {
        self.inner.array_buffer_exhausted.load(Ordering::SeqCst)
    }

    pub fn statistics(&self) -> IsolateStatistics {
        let inner = &self.inner;
        let (script_cache_size, cpu_profile_count) = inner.with_lock(|_| {
            // SAFETY: lock held
            let cache = unsafe { inner.script_cache.get() }.len();
            let profiles = unsafe { inner.debug.get() }.profile_count();
            (cache, profiles)
        });

        IsolateStatistics {
            script_count: inner.script_count.load(Ordering::SeqCst),
            script_cache_size,
            module_count: inner.module_count.load(Ordering::SeqCst),
            context_count: inner.live_contexts().len(),
            cpu_profile_count,
        }
    }
}

impl std::fmt::Debug for V8Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V8Isolate")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

unsafe extern "C" fn run_interrupt(isolate: &mut v8::Isolate, data: *mut c_void) {
    // SAFETY: produced by Box::into_raw in request_interrupt, consumed once
    let callback = unsafe { Box::from_raw(data as *mut LockCallback) };
    callback(isolate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn lock_is_reentrant_and_depth_unwinds() {
        let isolate = V8Isolate::with_defaults().unwrap();
        assert_eq!(isolate.lock_depth(), 0);

        let inner = isolate.inner.clone();
        let depths = isolate.inner.with_lock(|_| {
            let outer = inner.lock_depth();
            let nested = inner.with_lock(|_| inner.lock_depth());
            (outer, nested, inner.lock_depth())
        });

        assert_eq!(depths, (1, 2, 1));
        assert_eq!(isolate.lock_depth(), 0);
    }

    #[test]
    fn call_with_lock_runs_when_free() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let (tx, rx) = mpsc::channel();

        isolate.call_with_lock(false, move |_| tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn non_nesting_entries_wait_for_the_outermost_scope() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let (tx, rx) = mpsc::channel();

        let queued = isolate.clone();
        isolate.inner.with_lock(move |_| {
            let tx2 = tx.clone();
            queued.call_with_lock(false, move |_| tx2.send("deferred").unwrap());
            queued.call_with_lock(true, move |_| tx.send("nested").unwrap());
        });

        assert_eq!(rx.recv().unwrap(), "nested");
        assert_eq!(rx.recv().unwrap(), "deferred");
    }

    #[test]
    fn call_with_lock_sync_returns_the_result() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let remote = isolate.clone();

        let used = std::thread::spawn(move || {
            remote
                .call_with_lock_sync(|isolate| {
                    let mut stats = v8::HeapStatistics::default();
                    isolate.get_heap_statistics(&mut stats);
                    stats.used_heap_size()
                })
                .unwrap()
        })
        .join()
        .unwrap();

        assert!(used > 0);
    }

    #[test]
    fn request_interrupt_runs_on_next_entry() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();
        let (tx, rx) = mpsc::channel();

        assert!(isolate.request_interrupt(move |_| tx.send(()).unwrap()));
        context
            .execute(&crate::DocumentInfo::script("interrupt.js"), "for (let i = 0; i < 1e6; i++);", false)
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn rejects_invalid_options() {
        let options = IsolateOptions {
            heap_expansion_multiplier: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            V8Isolate::new(options, Arc::new(DefaultHostEnvironment)),
            Err(Error::Config(_))
        ));
    }
}
