//! Holders handed out to the host.
//!
//! - [`V8Object`]: a script object, kept alive by a `v8::Global`;
//! - [`HostObjectHolder`]: a host object, kept alive by an `Arc`;
//! - [`ScriptHolder`]: a compiled document.
//!
//! V8-side holders never keep their isolate or context alive. They carry a
//! [`WeakBinding`]; once the context is gone every operation fails with
//! `EntityDisposed` and dropping the holder leaves V8 alone.

use std::mem::ManuallyDrop;
use std::sync::{Arc, Weak};

use crate::context::{ContextInner, ContextState};
use crate::document::DocumentInfo;
use crate::error::Error;
use crate::host::HostObject;
use crate::isolate::IsolateInner;
use crate::marshal;
use crate::shared::WeakBinding;
use crate::value::{Value, ValueFlags, ValueSubtype};

/// A `v8::Global` owned by a host-side holder.
///
/// Dropped directly when the owning thread holds the isolate lock, queued
/// for the next lock entry otherwise, and leaked once the isolate is gone
/// (its heap went with it).
pub(crate) struct BoundGlobal<T: 'static> {
    global: ManuallyDrop<v8::Global<T>>,
    isolate: Weak<IsolateInner>,
}

// SAFETY: the Global is only dereferenced under the isolate lock; Drop
// routes the reset through the deferred-destruction queue otherwise.
unsafe impl<T: 'static> Send for BoundGlobal<T> {}
unsafe impl<T: 'static> Sync for BoundGlobal<T> {}

impl<T: 'static> BoundGlobal<T> {
    pub(crate) fn new(isolate: &Arc<IsolateInner>, global: v8::Global<T>) -> Self {
        Self {
            global: ManuallyDrop::new(global),
            isolate: Arc::downgrade(isolate),
        }
    }

    /// Only meaningful with the isolate locked.
    pub(crate) fn get(&self) -> &v8::Global<T> {
        &self.global
    }
}

impl<T: 'static> Drop for BoundGlobal<T> {
    fn drop(&mut self) {
        // SAFETY: taken exactly once, here
        let global = unsafe { ManuallyDrop::take(&mut self.global) };
        match self.isolate.upgrade() {
            Some(isolate) if isolate.is_locked_by_current_thread() => drop(global),
            Some(isolate) => isolate.deferred.defer(global),
            None => std::mem::forget(global),
        }
    }
}

struct SendBackingStore(v8::SharedRef<v8::BackingStore>);

// SAFETY: backing stores are reference counted with atomics on the V8 side
// and outlive every isolate that shares them.
unsafe impl Send for SendBackingStore {}
unsafe impl Sync for SendBackingStore {}

/// Backing store of an ArrayBuffer or view, captured at export.
///
/// Holding the store keeps the bytes valid after the context is torn down.
pub struct SharedObjectInfo {
    backing_store: SendBackingStore,
    pub offset: usize,
    pub size: usize,
    /// Element count for typed arrays, byte length otherwise.
    pub length: usize,
}

impl SharedObjectInfo {
    pub(crate) fn new(backing_store: v8::SharedRef<v8::BackingStore>, offset: usize, size: usize, length: usize) -> Self {
        Self {
            backing_store: SendBackingStore(backing_store),
            offset,
            size,
            length,
        }
    }

    fn bytes(&self) -> &mut [u8] {
        let store = &self.backing_store.0;
        let end = self.offset.saturating_add(self.size);
        match store.data() {
            Some(data) if self.size > 0 && end <= store.byte_length() => {
                // SAFETY: [offset, offset + size) lies inside the store,
                // which our SharedRef keeps allocated.
                unsafe { std::slice::from_raw_parts_mut((data.as_ptr() as *mut u8).add(self.offset), self.size) }
            }
            _ => &mut [],
        }
    }
}

pub(crate) struct V8ObjectHolder {
    object: BoundGlobal<v8::Object>,
    binding: WeakBinding,
    subtype: ValueSubtype,
    flags: ValueFlags,
    identity_hash: i32,
    shared: Option<SharedObjectInfo>,
}

/// A JavaScript object held by the host.
#[derive(Clone)]
pub struct V8Object(Arc<V8ObjectHolder>);

impl V8Object {
    pub(crate) fn new(
        scope: &mut v8::PinScope<'_, '_>,
        cx: &ContextInner,
        object: v8::Local<'_, v8::Object>,
        subtype: ValueSubtype,
        flags: ValueFlags,
        shared: Option<SharedObjectInfo>,
    ) -> Self {
        let identity_hash = object.get_identity_hash().get();
        let global = v8::Global::new(scope, object);
        Self(Arc::new(V8ObjectHolder {
            object: BoundGlobal::new(&cx.isolate, global),
            binding: WeakBinding::new(cx),
            subtype,
            flags,
            identity_hash,
            shared,
        }))
    }

    pub(crate) fn global(&self) -> &v8::Global<v8::Object> {
        self.0.object.get()
    }

    pub(crate) fn is_from(&self, isolate: &IsolateInner) -> bool {
        self.0.binding.is_bound_to(isolate)
    }

    pub fn subtype(&self) -> ValueSubtype {
        self.0.subtype
    }

    pub fn flags(&self) -> ValueFlags {
        self.0.flags
    }

    pub fn identity_hash(&self) -> i32 {
        self.0.identity_hash
    }

    pub fn isolate_id(&self) -> u64 {
        self.0.binding.isolate_id()
    }

    /// `true` while the issuing context is alive.
    pub fn is_alive(&self) -> bool {
        self.0.binding.context().is_some()
    }

    pub fn shared_info(&self) -> Option<&SharedObjectInfo> {
        self.0.shared.as_ref()
    }

    /// Identity: the same holder, or two holders of the same script object.
    pub fn same_object(&self, other: &V8Object) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if self.isolate_id() != other.isolate_id() || self.identity_hash() != other.identity_hash() {
            return false;
        }
        let Some(isolate) = self.0.binding.isolate() else {
            return false;
        };
        isolate.with_lock(|isolate| {
            let scope = std::pin::pin!(v8::HandleScope::new(isolate));
            let scope = scope.init();
            let a = v8::Local::new(&scope, self.global());
            let b = v8::Local::new(&scope, other.global());
            a.strict_equals(b.into())
        })
    }

    fn with_object<R>(
        &self,
        f: impl for<'s, 'i> FnOnce(&mut v8::PinScope<'s, 'i>, &ContextInner, &ContextState, v8::Local<'s, v8::Object>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let cx = self.0.binding.require_context()?;
        cx.with_scope(|scope, state| {
            let object = v8::Local::new(scope, self.global());
            f(scope, &cx, state, object)
        })
    }

    pub fn get_property(&self, name: &str) -> Result<Value, Error> {
        self.with_object(|scope, cx, state, object| {
            marshal::try_catch(scope, cx, state, |tc| {
                let key = v8::String::new(tc, name)?;
                let value = object.get(tc, key.into())?;
                if value.is_undefined() && !object.has(tc, key.into())? {
                    return Some(Value::Nonexistent);
                }
                Some(marshal::export_value(tc, cx, state, value))
            })
        })
    }

    pub fn set_property(&self, name: &str, value: Value) -> Result<(), Error> {
        self.with_object(|scope, cx, state, object| {
            let value = marshal::import_value(scope, cx, state, &value)?;
            marshal::try_catch(scope, cx, state, |tc| {
                let key = v8::String::new(tc, name)?;
                object.set(tc, key.into(), value).map(|_| ())
            })
        })
    }

    pub fn delete_property(&self, name: &str) -> Result<bool, Error> {
        self.with_object(|scope, cx, state, object| {
            marshal::try_catch(scope, cx, state, |tc| {
                let key = v8::String::new(tc, name)?;
                object.delete(tc, key.into())
            })
        })
    }

    /// Enumerable string-keyed properties, own and inherited.
    pub fn property_names(&self, include_indices: bool) -> Result<Vec<String>, Error> {
        self.with_object(|scope, cx, state, object| {
            marshal::try_catch(scope, cx, state, |tc| {
                let index_filter = if include_indices {
                    v8::IndexFilter::IncludeIndices
                } else {
                    v8::IndexFilter::SkipIndices
                };
                let names = object.get_property_names(
                    tc,
                    v8::GetPropertyNamesArgs {
                        mode: v8::KeyCollectionMode::IncludePrototypes,
                        property_filter: v8::PropertyFilter::ONLY_ENUMERABLE | v8::PropertyFilter::SKIP_SYMBOLS,
                        index_filter,
                        key_conversion: v8::KeyConversionMode::ConvertToString,
                    },
                )?;
                let mut out = Vec::with_capacity(names.length() as usize);
                for i in 0..names.length() {
                    let name = names.get_index(tc, i)?.to_string(tc)?;
                    out.push(name.to_rust_string_lossy(tc));
                }
                Some(out)
            })
        })
    }

    pub fn get_index(&self, index: u32) -> Result<Value, Error> {
        self.with_object(|scope, cx, state, object| {
            marshal::try_catch(scope, cx, state, |tc| {
                let value = object.get_index(tc, index)?;
                Some(marshal::export_value(tc, cx, state, value))
            })
        })
    }

    pub fn set_index(&self, index: u32, value: Value) -> Result<(), Error> {
        self.with_object(|scope, cx, state, object| {
            let value = marshal::import_value(scope, cx, state, &value)?;
            marshal::try_catch(scope, cx, state, |tc| object.set_index(tc, index, value).map(|_| ()))
        })
    }

    pub fn delete_index(&self, index: u32) -> Result<bool, Error> {
        self.with_object(|scope, cx, state, object| {
            marshal::try_catch(scope, cx, state, |tc| object.delete_index(tc, index))
        })
    }

    pub fn property_indices(&self) -> Result<Vec<u32>, Error> {
        self.with_object(|scope, cx, state, object| {
            marshal::try_catch(scope, cx, state, |tc| {
                let keys = object.get_property_names(
                    tc,
                    v8::GetPropertyNamesArgs {
                        mode: v8::KeyCollectionMode::OwnOnly,
                        property_filter: v8::PropertyFilter::ONLY_ENUMERABLE | v8::PropertyFilter::SKIP_SYMBOLS,
                        index_filter: v8::IndexFilter::IncludeIndices,
                        key_conversion: v8::KeyConversionMode::KeepNumbers,
                    },
                )?;
                let mut out = Vec::new();
                for i in 0..keys.length() {
                    let key = keys.get_index(tc, i)?;
                    if key.is_uint32() {
                        out.push(key.uint32_value(tc)?);
                    }
                }
                Some(out)
            })
        })
    }

    /// Call the object as a function, or as a constructor.
    pub fn invoke(&self, as_constructor: bool, args: &[Value]) -> Result<Value, Error> {
        self.with_object(|scope, cx, state, object| {
            let function = v8::Local::<v8::Function>::try_from(v8::Local::<v8::Value>::from(object))
                .map_err(|_| Error::general("TypeError: The object is not callable"))?;
            let args = marshal::import_args(scope, cx, state, args)?;
            marshal::try_catch(scope, cx, state, |tc| {
                let result = if as_constructor {
                    function.new_instance(tc, &args)?.into()
                } else {
                    let recv = v8::undefined(tc).into();
                    function.call(tc, recv, &args)?
                };
                Some(marshal::export_value(tc, cx, state, result))
            })
        })
    }

    /// Call `object[name](...args)` with `this` bound to the object.
    pub fn invoke_method(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        self.with_object(|scope, cx, state, object| {
            let args = marshal::import_args(scope, cx, state, args)?;
            let outcome = marshal::try_catch(scope, cx, state, |tc| {
                let key = v8::String::new(tc, name)?;
                let member = object.get(tc, key.into())?;
                let Ok(method) = v8::Local::<v8::Function>::try_from(member) else {
                    return Some(None);
                };
                let result = method.call(tc, object.into(), &args)?;
                Some(Some(marshal::export_value(tc, cx, state, result)))
            })?;
            outcome.ok_or_else(|| Error::general(format!("TypeError: '{name}' is not a function")))
        })
    }

    /// Run `f` over the bytes of an ArrayBuffer or view.
    ///
    /// Works after the context is gone: the backing store is shared.
    pub fn with_array_buffer_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, Error> {
        let info = self
            .0
            .shared
            .as_ref()
            .ok_or_else(|| Error::general("The object is not an ArrayBuffer or view"))?;
        match self.0.binding.isolate() {
            // script may touch the bytes concurrently otherwise
            Some(isolate) => Ok(isolate.with_lock(|_| f(info.bytes()))),
            None => Ok(f(info.bytes())),
        }
    }

    /// An owned copy of the bytes of an ArrayBuffer or view.
    pub fn array_buffer_bytes(&self) -> Result<bytes::Bytes, Error> {
        self.with_array_buffer_data(|data| bytes::Bytes::copy_from_slice(data))
    }
}

impl std::fmt::Debug for V8Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V8Object")
            .field("subtype", &self.0.subtype)
            .field("flags", &self.0.flags)
            .field("identity_hash", &self.0.identity_hash)
            .finish()
    }
}

/// A host object as seen by the bridge.
///
/// Construction and every clone call [`HostObject::add_ref`]; every drop
/// calls [`HostObject::release`].
pub struct HostObjectHolder {
    target: Arc<dyn HostObject>,
}

impl HostObjectHolder {
    pub fn new(target: Arc<dyn HostObject>) -> Self {
        target.add_ref();
        Self { target }
    }

    pub fn from_object(object: impl HostObject) -> Self {
        Self::new(Arc::new(object))
    }

    pub fn target(&self) -> &Arc<dyn HostObject> {
        &self.target
    }

    /// Address of the shared host object; the V8-object cache key.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.target) as *const () as usize
    }

    pub fn same_target(&self, other: &HostObjectHolder) -> bool {
        self.key() == other.key()
    }

    pub fn subtype(&self) -> ValueSubtype {
        self.target.subtype()
    }

    pub fn flags(&self) -> ValueFlags {
        self.target.flags()
    }
}

impl Clone for HostObjectHolder {
    fn clone(&self) -> Self {
        Self::new(self.target.clone())
    }
}

impl Drop for HostObjectHolder {
    fn drop(&mut self) {
        self.target.release();
    }
}

impl std::fmt::Debug for HostObjectHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HostObjectHolder").field(&format_args!("{:#x}", self.key())).finish()
    }
}

pub(crate) struct ScriptInner {
    pub(crate) isolate_id: u64,
    pub(crate) document: DocumentInfo,
    pub(crate) digest: u64,
    pub(crate) code: String,
    pub(crate) cache_bytes: Option<Vec<u8>>,
    /// `None` for module and JSON documents, which compile at execution.
    pub(crate) unbound: Option<BoundGlobal<v8::UnboundScript>>,
}

/// A compiled document, reusable across executions in the issuing isolate.
#[derive(Clone)]
pub struct ScriptHolder(pub(crate) Arc<ScriptInner>);

impl ScriptHolder {
    pub fn document(&self) -> &DocumentInfo {
        &self.0.document
    }

    pub fn code(&self) -> &str {
        &self.0.code
    }

    pub fn code_digest(&self) -> u64 {
        self.0.digest
    }

    pub fn cache_bytes(&self) -> Option<&[u8]> {
        self.0.cache_bytes.as_deref()
    }

    pub fn isolate_id(&self) -> u64 {
        self.0.isolate_id
    }
}

impl std::fmt::Debug for ScriptHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHolder")
            .field("document", &self.0.document)
            .field("digest", &format_args!("{:#018x}", self.0.digest))
            .field("isolate_id", &self.0.isolate_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counted {
        refs: AtomicUsize,
        releases: AtomicUsize,
    }

    struct Probe(Arc<Counted>);

    impl HostObject for Probe {
        fn add_ref(&self) {
            self.0.refs.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.0.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn holder_balances_add_ref_and_release() {
        let counts = Arc::new(Counted::default());
        let holder = HostObjectHolder::from_object(Probe(counts.clone()));
        let copy = holder.clone();

        assert!(holder.same_target(&copy));
        assert_eq!(counts.refs.load(Ordering::SeqCst), 2);

        drop(copy);
        drop(holder);
        assert_eq!(counts.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn distinct_targets_are_not_the_same() {
        let a = HostObjectHolder::from_object(Probe(Arc::default()));
        let b = HostObjectHolder::from_object(Probe(Arc::default()));
        assert!(!a.same_target(&b));
    }
}
