//! Host objects as seen from JavaScript.
//!
//! Each host object gets one wrapper per context, found again through
//! [`V8ObjectCache`] so identity holds across imports. The wrapper carries a
//! private `External` pointing at the boxed [`HostObjectHolder`] owned by the
//! cache entry; the entry lives until the wrapper is collected or the
//! context goes away, whichever comes first.
//!
//! Plain host objects are instances of one template with named and indexed
//! interceptors. Callable host objects are real functions whose callback
//! data is the same `External`; they answer `typeof` with `"function"` but
//! their properties are the function's own.

pub(crate) mod exception;
pub(crate) mod iterator;

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::{ContextInner, ContextState, PendingRelease, Privates};
use crate::error::{ENGINE_DESTROYED, Error, HostError};
use crate::handles::Persistent;
use crate::holder::HostObjectHolder;
use crate::host::{HostObject, Invocability};
use crate::marshal;
use crate::value::Value;

pub(crate) struct Templates {
    object: v8::Global<v8::ObjectTemplate>,
    iterator: v8::Global<v8::Function>,
    async_iterator: v8::Global<v8::Function>,
}

impl Templates {
    pub(crate) fn new(scope: &mut v8::PinScope<'_, '_>) -> Result<Self, Error> {
        let class = v8::FunctionTemplate::new(scope, illegal_constructor);
        class.set_class_name(new_string(scope, "HostObject")?);

        let instance = class.instance_template(scope);
        instance.set_named_property_handler(
            v8::NamedPropertyHandlerConfiguration::new()
                .getter(named_getter)
                .setter(named_setter)
                .deleter(named_deleter)
                .enumerator(named_enumerator)
                .flags(v8::PropertyHandlerFlags::ONLY_INTERCEPT_STRINGS),
        );
        instance.set_indexed_property_handler(
            v8::IndexedPropertyHandlerConfiguration::new()
                .getter(indexed_getter)
                .setter(indexed_setter)
                .deleter(indexed_deleter)
                .enumerator(indexed_enumerator),
        );

        let iterator = v8::FunctionTemplate::new(scope, iterator::iterator_callback);
        let async_iterator = v8::FunctionTemplate::new(scope, iterator::async_iterator_callback);
        let prototype = class.prototype_template(scope);
        let key = v8::Symbol::get_iterator(scope);
        prototype.set(key.into(), iterator.into());
        let key = v8::Symbol::get_async_iterator(scope);
        prototype.set(key.into(), async_iterator.into());
        let key = v8::Symbol::get_to_string_tag(scope);
        let tag = new_string(scope, "HostObject")?;
        prototype.set_with_attr(
            key.into(),
            tag.into(),
            v8::PropertyAttribute::READ_ONLY | v8::PropertyAttribute::DONT_ENUM,
        );

        let iterator = iterator
            .get_function(scope)
            .ok_or_else(|| Error::general("Failed to create the host iterator function"))?;
        let async_iterator = async_iterator
            .get_function(scope)
            .ok_or_else(|| Error::general("Failed to create the host iterator function"))?;

        Ok(Self {
            object: v8::Global::new(scope, instance),
            iterator: v8::Global::new(scope, iterator),
            async_iterator: v8::Global::new(scope, async_iterator),
        })
    }
}

pub(crate) struct CachedWrapper {
    generation: u64,
    holder: Box<HostObjectHolder>,
    handle: Persistent<v8::Object>,
}

/// Host object → wrapper, per context.
#[derive(Default)]
pub(crate) struct V8ObjectCache {
    entries: HashMap<usize, CachedWrapper>,
    next_generation: u64,
}

impl V8ObjectCache {
    fn lookup<'s>(&self, scope: &mut v8::PinScope<'s, '_>, key: usize) -> Option<v8::Local<'s, v8::Object>> {
        self.entries.get(&key)?.handle.get(scope)
    }

    /// Drop the entry if it still belongs to the collected wrapper.
    pub(crate) fn remove(&mut self, key: usize, generation: u64) -> Option<CachedWrapper> {
        match self.entries.get(&key) {
            Some(entry) if entry.generation == generation => self.entries.remove(&key),
            _ => None,
        }
    }

    /// Empty the cache, unlinking every live wrapper from its holder.
    pub(crate) fn detach_all(&mut self, scope: &mut v8::PinScope<'_, '_>, privates: &Privates) -> Vec<CachedWrapper> {
        let private = v8::Local::new(scope, &privates.host_object);
        self.entries
            .drain()
            .map(|(_, mut entry)| {
                if let Some(object) = entry.handle.get(scope) {
                    object.delete_private(scope, private);
                }
                entry.handle.dispose();
                entry
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The wrapper for `holder` in this context, created on first use.
pub(crate) fn wrap<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    holder: &HostObjectHolder,
) -> Result<v8::Local<'s, v8::Object>, Error> {
    let key = holder.key();
    if let Some(existing) = state.host_objects.borrow().lookup(scope, key) {
        return Ok(existing);
    }

    let boxed = Box::new(holder.clone());
    let external = v8::External::new(scope, &*boxed as *const HostObjectHolder as *mut c_void);
    let object = match holder.target().invocability() {
        Invocability::None => {
            let template = v8::Local::new(scope, &state.templates.object);
            template
                .new_instance(scope)
                .ok_or_else(|| Error::general("Failed to create a host object wrapper"))?
        }
        invocability => callable_wrapper(scope, state, external, invocability)?,
    };
    let private = v8::Local::new(scope, &state.privates.host_object);
    object.set_private(scope, private, external.into());

    let mut handle = Persistent::new(scope, object);
    let replaced = {
        let mut cache = state.host_objects.borrow_mut();
        cache.next_generation += 1;
        let generation = cache.next_generation;
        let releases = cx.releases.clone();
        handle.set_weak(scope, move |_| {
            releases.lock().push(PendingRelease::HostObject { key, generation });
        });
        cache.entries.insert(
            key,
            CachedWrapper {
                generation,
                holder: boxed,
                handle,
            },
        )
    };
    // a collected wrapper whose release is still queued
    drop(replaced);
    Ok(object)
}

fn callable_wrapper<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    state: &ContextState,
    external: v8::Local<'s, v8::External>,
    invocability: Invocability,
) -> Result<v8::Local<'s, v8::Object>, Error> {
    let function = v8::Function::builder(invoke_callback)
        .data(external.into())
        .build(scope)
        .ok_or_else(|| Error::general("Failed to create a host function wrapper"))?;

    let tag = match invocability {
        Invocability::Delegate => "HostDelegate",
        _ => "HostFunction",
    };
    let key = v8::Symbol::get_to_string_tag(scope);
    let tag = new_string(scope, tag)?;
    function.define_own_property(
        scope,
        key.into(),
        tag.into(),
        v8::PropertyAttribute::READ_ONLY | v8::PropertyAttribute::DONT_ENUM,
    );

    let key = v8::Symbol::get_iterator(scope);
    let iterator = v8::Local::new(scope, &state.templates.iterator);
    function.set(scope, key.into(), iterator.into());
    let key = v8::Symbol::get_async_iterator(scope);
    let async_iterator = v8::Local::new(scope, &state.templates.async_iterator);
    function.set(scope, key.into(), async_iterator.into());

    Ok(function.into())
}

fn holder_ptr(
    scope: &mut v8::PinScope<'_, '_>,
    state: &ContextState,
    object: v8::Local<'_, v8::Object>,
) -> Option<*const HostObjectHolder> {
    let private = v8::Local::new(scope, &state.privates.host_object);
    let data = object.get_private(scope, private)?;
    let external = v8::Local::<v8::External>::try_from(data).ok()?;
    Some(external.value() as *const HostObjectHolder)
}

/// The host object behind a wrapper of this context.
pub(crate) fn unwrap(
    scope: &mut v8::PinScope<'_, '_>,
    state: &ContextState,
    object: v8::Local<'_, v8::Object>,
) -> Option<HostObjectHolder> {
    let ptr = holder_ptr(scope, state, object)?;
    // SAFETY: the private is only present while the cache entry that owns
    // the boxed holder is alive.
    Some(unsafe { &*ptr }.clone())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(_) => "Host callback panicked".to_string(),
    }
}

/// Run a host upcall from inside a V8 callback.
///
/// `None` means the stack limit tripped and termination is already pending.
/// A panic comes back as a host error.
pub(crate) fn guarded<R>(cx: &ContextInner, f: impl FnOnce() -> Result<R, HostError>) -> Option<Result<R, HostError>> {
    if cx.isolate.check_stack_usage().is_err() {
        return None;
    }
    Some(panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload);
        tracing::warn!("Host callback panicked: {}", message);
        Err(HostError::msg(message))
    }))
}

/// [`guarded`], with a host error thrown into script.
pub(crate) fn guarded_or_throw<R>(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    f: impl FnOnce() -> Result<R, HostError>,
) -> Option<R> {
    match guarded(cx, f)? {
        Ok(value) => Some(value),
        Err(error) => {
            exception::throw_host_error(scope, cx, error);
            None
        }
    }
}

/// A callback's way back to the host object it was invoked on.
struct Upcall {
    cx: Arc<ContextInner>,
    target: Arc<dyn HostObject>,
}

impl Upcall {
    /// Resolve through the wrapper's creation context, so a wrapper handed
    /// to another context still reaches its host object.
    fn new(scope: &mut v8::PinScope<'_, '_>, object: v8::Local<'_, v8::Object>) -> Option<Self> {
        let context = object.get_creation_context(scope)?;
        let cx = ContextInner::from_context(context)?;
        let target = {
            let state = cx.state().ok()?;
            let ptr = holder_ptr(scope, state, object)?;
            // SAFETY: see `unwrap`
            unsafe { &*ptr }.target().clone()
        };
        Some(Self { cx, target })
    }

    fn call<R>(&self, scope: &mut v8::PinScope<'_, '_>, f: impl FnOnce(&dyn HostObject) -> Result<R, HostError>) -> Option<R> {
        guarded_or_throw(scope, &self.cx, || f(&*self.target))
    }

    fn export(&self, scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Option<Value> {
        let state = self.cx.state().ok()?;
        Some(marshal::export_value(scope, &self.cx, state, value))
    }

    fn export_args(&self, scope: &mut v8::PinScope<'_, '_>, args: &v8::FunctionCallbackArguments<'_>) -> Option<Vec<Value>> {
        let state = self.cx.state().ok()?;
        Some(
            (0..args.length())
                .map(|i| marshal::export_value(scope, &self.cx, state, args.get(i)))
                .collect(),
        )
    }

    /// Import a host result; failures are thrown.
    fn import<'s>(&self, scope: &mut v8::PinScope<'s, '_>, value: &Value) -> Option<v8::Local<'s, v8::Value>> {
        let imported = self
            .cx
            .state()
            .and_then(|state| marshal::import_value(scope, &self.cx, state, value));
        match imported {
            Ok(value) => Some(value),
            Err(error) => {
                exception::throw_error(scope, &error.to_string(), false);
                None
            }
        }
    }

    /// The wrapper's cache of stable property values.
    fn property_cache<'s>(
        &self,
        scope: &mut v8::PinScope<'s, '_>,
        object: v8::Local<'s, v8::Object>,
        create: bool,
    ) -> Option<v8::Local<'s, v8::Object>> {
        let state = self.cx.state().ok()?;
        let private = v8::Local::new(scope, &state.privates.property_cache);
        let existing = object.get_private(scope, private)?;
        if let Ok(cache) = v8::Local::<v8::Object>::try_from(existing) {
            return Some(cache);
        }
        if !create {
            return None;
        }
        let null = v8::null(scope).into();
        let cache = v8::Object::with_prototype_and_properties(scope, null, &[], &[]);
        object.set_private(scope, private, cache.into());
        Some(cache)
    }
}

fn new_string<'s>(scope: &mut v8::PinScope<'s, '_>, s: &str) -> Result<v8::Local<'s, v8::String>, Error> {
    v8::String::new(scope, s).ok_or_else(|| Error::general("Failed to allocate a string"))
}

/// The host-side name of a string key. Names holding a lone surrogate have
/// no `&str` form, so they are refused with a `TypeError` rather than altered.
fn property_name(scope: &mut v8::PinScope<'_, '_>, key: v8::Local<'_, v8::Value>) -> Option<String> {
    let key = v8::Local::<v8::String>::try_from(key).ok()?;
    match String::from_utf16(marshal::export_string(scope, key).as_utf16()) {
        Ok(name) => Some(name),
        Err(_) => {
            exception::throw_error(scope, INVALID_NAME_MESSAGE, true);
            None
        }
    }
}

const INVALID_NAME_MESSAGE: &str = "Host object property names must be well-formed UTF-16";

fn illegal_constructor(scope: &mut v8::PinScope<'_, '_>, _args: v8::FunctionCallbackArguments<'_>, _rv: v8::ReturnValue<v8::Value>) {
    exception::throw_error(scope, "Illegal constructor", true);
}

fn named_getter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    key: v8::Local<'s, v8::Name>,
    args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Value>,
) -> v8::Intercepted {
    let holder = args.holder();
    let Some(upcall) = Upcall::new(scope, holder) else {
        return v8::Intercepted::No;
    };

    if let Some(cache) = upcall.property_cache(scope, holder, false) {
        if cache.has_own_property(scope, key) == Some(true) {
            if let Some(value) = cache.get(scope, key.into()) {
                rv.set(value);
            }
            return v8::Intercepted::Yes;
        }
    }

    let Some(name) = property_name(scope, key.into()) else {
        return v8::Intercepted::Yes;
    };
    let Some(property) = upcall.call(scope, |target| target.get_named_property(&name)) else {
        return v8::Intercepted::Yes;
    };

    let value = if property.is_method {
        let Some(method) = method_function(scope, key, holder) else {
            return v8::Intercepted::Yes;
        };
        method.into()
    } else if property.value.is_nonexistent() {
        return v8::Intercepted::No;
    } else {
        let Some(value) = upcall.import(scope, &property.value) else {
            return v8::Intercepted::Yes;
        };
        value
    };

    if property.cacheable {
        if let Some(cache) = upcall.property_cache(scope, holder, true) {
            cache.set(scope, key.into(), value);
        }
    }
    rv.set(value);
    v8::Intercepted::Yes
}

fn named_setter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    key: v8::Local<'s, v8::Name>,
    value: v8::Local<'s, v8::Value>,
    args: v8::PropertyCallbackArguments<'s>,
    _rv: v8::ReturnValue<()>,
) -> v8::Intercepted {
    let Some(upcall) = Upcall::new(scope, args.holder()) else {
        return v8::Intercepted::No;
    };
    let Some(name) = property_name(scope, key.into()) else {
        return v8::Intercepted::Yes;
    };
    let Some(value) = upcall.export(scope, value) else {
        return v8::Intercepted::No;
    };
    upcall.call(scope, |target| target.set_named_property(&name, value));
    v8::Intercepted::Yes
}

fn named_deleter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    key: v8::Local<'s, v8::Name>,
    args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Boolean>,
) -> v8::Intercepted {
    let holder = args.holder();
    let Some(upcall) = Upcall::new(scope, holder) else {
        return v8::Intercepted::No;
    };
    let Some(name) = property_name(scope, key.into()) else {
        return v8::Intercepted::Yes;
    };
    if let Some(deleted) = upcall.call(scope, |target| target.delete_named_property(&name)) {
        if deleted {
            if let Some(cache) = upcall.property_cache(scope, holder, false) {
                cache.delete(scope, key.into());
            }
        }
        rv.set_bool(deleted);
    }
    v8::Intercepted::Yes
}

fn named_enumerator<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Array>,
) {
    let Some(upcall) = Upcall::new(scope, args.holder()) else {
        return;
    };
    let Some(names) = upcall.call(scope, |target| target.property_names()) else {
        return;
    };
    let names: Vec<v8::Local<v8::Value>> = names
        .iter()
        .filter_map(|name| v8::String::new(scope, name).map(Into::into))
        .collect();
    rv.set(v8::Array::new_with_elements(scope, &names));
}

fn indexed_getter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    index: u32,
    args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Value>,
) -> v8::Intercepted {
    let Ok(index) = i32::try_from(index) else {
        return v8::Intercepted::No;
    };
    let Some(upcall) = Upcall::new(scope, args.holder()) else {
        return v8::Intercepted::No;
    };
    let Some(value) = upcall.call(scope, |target| target.get_indexed_property(index)) else {
        return v8::Intercepted::Yes;
    };
    if value.is_nonexistent() {
        return v8::Intercepted::No;
    }
    if let Some(value) = upcall.import(scope, &value) {
        rv.set(value);
    }
    v8::Intercepted::Yes
}

fn indexed_setter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    index: u32,
    value: v8::Local<'s, v8::Value>,
    args: v8::PropertyCallbackArguments<'s>,
    _rv: v8::ReturnValue<()>,
) -> v8::Intercepted {
    let Ok(index) = i32::try_from(index) else {
        return v8::Intercepted::No;
    };
    let Some(upcall) = Upcall::new(scope, args.holder()) else {
        return v8::Intercepted::No;
    };
    let Some(value) = upcall.export(scope, value) else {
        return v8::Intercepted::No;
    };
    upcall.call(scope, |target| target.set_indexed_property(index, value));
    v8::Intercepted::Yes
}

fn indexed_deleter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    index: u32,
    args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Boolean>,
) -> v8::Intercepted {
    let Ok(index) = i32::try_from(index) else {
        return v8::Intercepted::No;
    };
    let Some(upcall) = Upcall::new(scope, args.holder()) else {
        return v8::Intercepted::No;
    };
    if let Some(deleted) = upcall.call(scope, |target| target.delete_indexed_property(index)) {
        rv.set_bool(deleted);
    }
    v8::Intercepted::Yes
}

fn indexed_enumerator<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Array>,
) {
    let Some(upcall) = Upcall::new(scope, args.holder()) else {
        return;
    };
    let Some(indices) = upcall.call(scope, |target| target.property_indices()) else {
        return;
    };
    let indices: Vec<v8::Local<v8::Value>> = indices
        .into_iter()
        .filter(|index| *index >= 0)
        .map(|index| v8::Integer::new(scope, index).into())
        .collect();
    rv.set(v8::Array::new_with_elements(scope, &indices));
}

/// A function calling `invoke_method(name)` on the wrapper's host object.
fn method_function<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    name: v8::Local<'s, v8::Name>,
    wrapper: v8::Local<'s, v8::Object>,
) -> Option<v8::Local<'s, v8::Function>> {
    let data = v8::Array::new_with_elements(scope, &[name.into(), wrapper.into()]);
    v8::Function::builder(method_callback).data(data.into()).build(scope)
}

fn method_callback(scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    let Ok(data) = v8::Local::<v8::Array>::try_from(args.data()) else {
        return;
    };
    let (Some(name), Some(wrapper)) = (data.get_index(scope, 0), data.get_index(scope, 1)) else {
        return;
    };
    let Ok(wrapper) = v8::Local::<v8::Object>::try_from(wrapper) else {
        return;
    };
    let Some(upcall) = Upcall::new(scope, wrapper) else {
        exception::throw_error(scope, ENGINE_DESTROYED, false);
        return;
    };

    let Some(name) = property_name(scope, name) else {
        return;
    };
    let Some(args) = upcall.export_args(scope, &args) else {
        return;
    };
    let Some(result) = upcall.call(scope, |target| target.invoke_method(&name, args)) else {
        return;
    };
    if let Some(value) = upcall.import(scope, &result) {
        rv.set(value);
    }
}

/// Call handler of callable host objects.
fn invoke_callback(scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    let Some(cx) = ContextInner::from_scope(scope) else {
        exception::throw_error(scope, ENGINE_DESTROYED, false);
        return;
    };
    let Ok(external) = v8::Local::<v8::External>::try_from(args.data()) else {
        return;
    };
    // SAFETY: the function runs in its creation context, which is alive, so
    // the cache entry owning the holder is too (it only goes earlier when
    // the function itself was collected).
    let target = unsafe { &*(external.value() as *const HostObjectHolder) }.target().clone();
    let upcall = Upcall { cx, target };

    let as_constructor = !args.new_target().is_undefined();
    let Some(args) = upcall.export_args(scope, &args) else {
        return;
    };
    let Some(result) = upcall.call(scope, |target| target.invoke(as_constructor, args)) else {
        return;
    };
    if let Some(value) = upcall.import(scope, &result) {
        rv.set(value);
    }
}
