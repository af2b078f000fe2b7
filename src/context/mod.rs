//! Contexts: one JavaScript global environment inside an isolate.
//!
//! ```text
//! V8Context (Clone, Send + Sync)
//!   └── Arc<ContextInner>
//!         ├── Arc<IsolateInner>          keeps the isolate alive
//!         ├── ContextState (lock-only)   v8::Context, templates, caches, module map
//!         └── pending releases           filled by weak finalizers, drained on entry
//! ```
//!
//! The `v8::Context` carries a pointer back to its `ContextInner` in embedder
//! slot [`CONTEXT_SLOT`], so V8 callbacks can find their way home. `Drop`
//! nulls the slot before the state goes away.

mod code_cache;
mod compile;
mod global;

use std::cell::RefCell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub use compile::{CacheKind, CacheResult};
pub(crate) use compile::{origin_unique_id, script_origin};

use crate::config::ContextOptions;
use crate::error::{ENGINE_DESTROYED, Error};
use crate::holder::V8Object;
use crate::host_object::exception::HostExceptionTable;
use crate::host_object::iterator::EnumeratorTable;
use crate::host_object::{Templates, V8ObjectCache};
use crate::isolate::{IsolateInner, LockedCell, MessageLoopExit, PauseReason, V8Isolate};
use crate::module_loader::ModuleMap;
use crate::value::{ValueFlags, ValueSubtype};

/// Embedder data slot holding `*const ContextInner`.
pub(crate) const CONTEXT_SLOT: i32 = 1;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Work left behind by a weak finalizer.
///
/// Finalizers run inside GC, possibly while a table is borrowed, so they
/// only record what to release; the next context entry does the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingRelease {
    HostObject { key: usize, generation: u64 },
    HostException(u64),
    Enumerator(u64),
}

pub(crate) type ReleaseQueue = Arc<Mutex<Vec<PendingRelease>>>;

pub(crate) struct Privates {
    /// `External` pointing at the wrapper's `HostObjectHolder`.
    pub(crate) host_object: v8::Global<v8::Private>,
    /// Id of a tunnelled `HostError`.
    pub(crate) host_exception: v8::Global<v8::Private>,
    /// Null-prototype object holding a wrapper's cacheable properties.
    pub(crate) property_cache: v8::Global<v8::Private>,
}

pub(crate) struct GlobalMember {
    pub(crate) name: String,
    pub(crate) object: v8::Global<v8::Object>,
}

/// Everything a context owns inside V8. Only touched under the isolate lock.
pub(crate) struct ContextState {
    pub(crate) context: v8::Global<v8::Context>,
    pub(crate) privates: Privates,
    pub(crate) templates: Templates,
    pub(crate) global_members: RefCell<Vec<GlobalMember>>,
    pub(crate) host_objects: RefCell<V8ObjectCache>,
    pub(crate) host_exceptions: RefCell<HostExceptionTable>,
    pub(crate) enumerators: RefCell<EnumeratorTable>,
    pub(crate) modules: RefCell<ModuleMap>,
}

// SAFETY: every access happens on the thread holding the isolate lock, which
// serializes all threads.
unsafe impl Send for ContextState {}

pub(crate) struct ContextInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) options: ContextOptions,
    pub(crate) isolate: Arc<IsolateInner>,
    pub(crate) weak_self: Weak<ContextInner>,
    /// Set once before the context is published; taken by `Drop`.
    state: LockedCell<Option<ContextState>>,
    pub(crate) releases: ReleaseQueue,
    pub(crate) script_count: AtomicUsize,
}

impl ContextInner {
    pub(crate) fn state(&self) -> Result<&ContextState, Error> {
        // SAFETY: written before any other thread can see the context and
        // only taken by Drop, which has exclusive access.
        unsafe { self.state.get_ref() }
            .as_ref()
            .ok_or(Error::EntityDisposed(ENGINE_DESTROYED))
    }

    /// Lock the isolate, enter the context and open an execution scope.
    pub(crate) fn with_scope<R>(
        &self,
        f: impl FnOnce(&mut v8::PinScope<'_, '_>, &ContextState) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.isolate.check_alive()?;
        let state = self.state()?;
        self.isolate.with_lock(|isolate| {
            let scope = std::pin::pin!(v8::HandleScope::new(isolate));
            let mut scope = scope.init();
            let context = v8::Local::new(&scope, &state.context);
            let scope = &mut v8::ContextScope::new(&mut scope, context);

            self.process_releases(state);
            self.isolate.execution_scope(|| f(scope, state))
        })
    }

    /// The context a V8 callback is running in.
    ///
    /// Returns a strong reference so the context cannot be torn down while
    /// the callback is still using it.
    pub(crate) fn from_scope(scope: &mut v8::PinScope<'_, '_>) -> Option<Arc<ContextInner>> {
        let context = scope.get_current_context();
        Self::from_context(context)
    }

    pub(crate) fn from_context(context: v8::Local<'_, v8::Context>) -> Option<Arc<ContextInner>> {
        // SAFETY: the slot holds null or a pointer written by V8Context::new;
        // ContextInner's Drop nulls it before the allocation goes away.
        let ptr = unsafe { context.get_aligned_pointer_from_embedder_data(CONTEXT_SLOT) } as *const ContextInner;
        if ptr.is_null() {
            return None;
        }
        // SAFETY: non-null means Drop has not run yet (see above)
        unsafe { &*ptr }.weak_self.upgrade()
    }

    pub(crate) fn push_release(&self, release: PendingRelease) {
        self.releases.lock().push(release);
    }

    /// Apply releases recorded by weak finalizers.
    fn process_releases(&self, state: &ContextState) {
        let pending = std::mem::take(&mut *self.releases.lock());
        if pending.is_empty() {
            return;
        }
        tracing::trace!("Context {} processing {} pending releases", self.id, pending.len());

        // Removed entries are dropped after their table borrow ends: closing
        // an enumerator or releasing a holder runs host code.
        let mut dropped_objects = Vec::new();
        let mut dropped_errors = Vec::new();
        let mut dropped_enumerators = Vec::new();
        for release in pending {
            match release {
                PendingRelease::HostObject { key, generation } => {
                    dropped_objects.extend(state.host_objects.borrow_mut().remove(key, generation));
                }
                PendingRelease::HostException(id) => {
                    dropped_errors.extend(state.host_exceptions.borrow_mut().remove(id));
                }
                PendingRelease::Enumerator(id) => {
                    dropped_enumerators.extend(state.enumerators.borrow_mut().remove(id));
                }
            }
        }
        for mut enumerator in dropped_enumerators {
            enumerator.close();
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        tracing::debug!("Disposing context {} ({})", self.id, self.name);

        let Some(state) = self.state.get_mut().take() else {
            return;
        };
        let isolate = self.isolate.clone();
        isolate.with_lock(|v8_isolate| {
            let scope = std::pin::pin!(v8::HandleScope::new(v8_isolate));
            let mut scope = scope.init();
            let context = v8::Local::new(&scope, &state.context);
            context.set_aligned_pointer_in_embedder_data(CONTEXT_SLOT, std::ptr::null_mut());
            let scope = &mut v8::ContextScope::new(&mut scope, context);

            if self.options.enable_debugging {
                crate::debug::context_destroyed(&isolate, scope, context);
            }

            // Wrappers may outlive the context inside V8; cut them loose so
            // a stray callback finds no holder.
            let objects = state.host_objects.borrow_mut().detach_all(scope, &state.privates);
            let mut enumerators = state.enumerators.borrow_mut().take_all();
            for enumerator in enumerators.iter_mut() {
                enumerator.close();
            }
            drop(objects);
            drop(enumerators);
            drop(state);
        });

        isolate.contexts.lock().retain(|c| c.strong_count() > 0);
    }
}

/// Counters reported by [`V8Context::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStatistics {
    pub script_count: usize,
    pub module_count: usize,
    pub module_cache_size: usize,
}

/// A JavaScript global environment. Cheap to clone; usable from any thread.
#[derive(Clone)]
pub struct V8Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl V8Context {
    pub(crate) fn new(isolate: &Arc<IsolateInner>, options: ContextOptions) -> Result<Self, Error> {
        isolate.check_alive()?;

        let inner = Arc::new_cyclic(|weak_self| ContextInner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: options.name.clone(),
            options,
            isolate: isolate.clone(),
            weak_self: weak_self.clone(),
            state: LockedCell::new(None),
            releases: Arc::new(Mutex::new(Vec::new())),
            script_count: AtomicUsize::new(0),
        });

        isolate.with_lock(|v8_isolate| -> Result<(), Error> {
            let scope = std::pin::pin!(v8::HandleScope::new(v8_isolate));
            let mut scope = scope.init();

            let global_template = global::global_template(&mut scope);
            let context = v8::Context::new(
                &scope,
                v8::ContextOptions {
                    global_template: Some(global_template),
                    ..Default::default()
                },
            );
            context.set_aligned_pointer_in_embedder_data(CONTEXT_SLOT, Arc::as_ptr(&inner) as *mut c_void);
            let scope = &mut v8::ContextScope::new(&mut scope, context);

            let privates = Privates {
                host_object: new_private(scope, "v8-host-bridge::host-object")?,
                host_exception: new_private(scope, "v8-host-bridge::host-exception")?,
                property_cache: new_private(scope, "v8-host-bridge::property-cache")?,
            };
            let templates = Templates::new(scope)?;

            let state = ContextState {
                context: v8::Global::new(scope, context),
                privates,
                templates,
                global_members: RefCell::new(Vec::new()),
                host_objects: RefCell::new(V8ObjectCache::default()),
                host_exceptions: RefCell::new(HostExceptionTable::default()),
                enumerators: RefCell::new(EnumeratorTable::default()),
                modules: RefCell::new(ModuleMap::new(isolate.env.max_module_cache_size())),
            };
            // SAFETY: lock held; the context is not published yet
            *unsafe { inner.state.get() } = Some(state);

            if inner.options.enable_debugging {
                crate::debug::context_created(isolate, scope, context, &inner)?;
            }
            Ok(())
        })?;

        isolate.contexts.lock().push(Arc::downgrade(&inner));
        tracing::debug!(
            "Created context {} ({}) in isolate {}",
            inner.id,
            inner.name,
            isolate.name
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    pub fn isolate(&self) -> V8Isolate {
        V8Isolate {
            inner: self.inner.isolate.clone(),
        }
    }

    /// The global object.
    pub fn get_root_object(&self) -> Result<V8Object, Error> {
        let cx = &self.inner;
        cx.with_scope(|scope, _state| {
            let global = scope.get_current_context().global(scope);
            Ok(V8Object::new(scope, cx, global, ValueSubtype::None, ValueFlags::empty(), None))
        })
    }

    /// Run `action` with the isolate locked and this context entered.
    pub fn invoke_with_lock<R>(&self, action: impl FnOnce() -> R) -> Result<R, Error> {
        self.inner.with_scope(|_scope, _state| Ok(action()))
    }

    pub fn statistics(&self) -> Result<ContextStatistics, Error> {
        let cx = &self.inner;
        cx.isolate.with_lock(|_| {
            let state = cx.state()?;
            let modules = state.modules.borrow();
            Ok(ContextStatistics {
                script_count: cx.script_count.load(Ordering::SeqCst),
                module_count: modules.module_count(),
                module_cache_size: modules.len(),
            })
        })
    }

    /// Block in the inspector message loop until a debugger resumes.
    ///
    /// Returns how the wait ended: `Resumed` by the inspector, `Canceled` by
    /// [`cancel_await_debugger`](Self::cancel_await_debugger) or
    /// `Terminated` by `terminate_execution`.
    pub fn await_debugger_and_pause(&self) -> Result<MessageLoopExit, Error> {
        let cx = &self.inner;
        cx.with_scope(|_scope, _state| {
            let exit = cx.isolate.run_message_loop(PauseReason::AwaitingDebugger);
            if exit == MessageLoopExit::Resumed {
                crate::debug::schedule_pause_on_next_statement(&cx.isolate);
            }
            Ok(exit)
        })
    }

    /// Release a thread blocked in `await_debugger_and_pause`. Safe from any thread.
    pub fn cancel_await_debugger(&self) -> bool {
        let queue = &self.inner.isolate.queue;
        queue.pause_reason() == Some(PauseReason::AwaitingDebugger) && queue.request_exit(MessageLoopExit::Canceled)
    }
}

impl std::fmt::Debug for V8Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V8Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

fn new_private(scope: &mut v8::PinScope<'_, '_>, name: &str) -> Result<v8::Global<v8::Private>, Error> {
    let name = v8::String::new(scope, name).ok_or_else(|| Error::general("Failed to create private name"))?;
    let private = v8::Private::new(scope, Some(name));
    Ok(v8::Global::new(scope, private))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentInfo, Value};

    #[test]
    fn context_slot_points_home() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();

        let found = context
            .inner
            .with_scope(|scope, _| Ok(ContextInner::from_scope(scope).map(|cx| cx.id)))
            .unwrap();
        assert_eq!(found, Some(context.id()));
        assert_eq!(context.invoke_with_lock(|| isolate.lock_depth()).unwrap(), 1);
    }

    #[test]
    fn holders_fail_after_context_drop() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();
        let obj = context
            .execute(&DocumentInfo::script("obj.js"), "({ a: 1 })", true)
            .unwrap();
        let Value::V8Object(obj) = obj else {
            panic!("expected an object");
        };
        assert_eq!(obj.get_property("a").unwrap(), Value::Int32(1));

        drop(context);
        assert!(!obj.is_alive());
        assert!(matches!(obj.get_property("a"), Err(Error::EntityDisposed(_))));
    }

    #[test]
    fn statistics_count_scripts() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();
        for _ in 0..3 {
            context.execute(&DocumentInfo::script("s.js"), "1", false).unwrap();
        }
        assert_eq!(context.statistics().unwrap().script_count, 3);
        assert_eq!(isolate.statistics().context_count, 1);
    }
}
