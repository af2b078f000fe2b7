//! `Symbol.iterator` and `Symbol.asyncIterator` over host enumerators.
//!
//! Each iteration gets a plain `{ next, return }` object whose functions
//! carry the enumerator id as callback data. The enumerator lives in the
//! context's [`EnumeratorTable`] until it is exhausted, returned, or its
//! iterator object is collected; it is closed in every case.

use std::collections::HashMap;

use super::{Upcall, exception, guarded};
use crate::context::{ContextInner, ContextState, PendingRelease};
use crate::error::{Error, HostError};
use crate::handles::Persistent;
use crate::host::{HostAsyncEnumerator, HostEnumerator};
use crate::marshal;
use crate::value::Value;

pub(crate) enum Enumerator {
    Sync(Box<dyn HostEnumerator>),
    Async(Box<dyn HostAsyncEnumerator>),
}

impl Enumerator {
    fn next(&mut self) -> Result<Option<Value>, HostError> {
        match self {
            Enumerator::Sync(e) => e.next(),
            Enumerator::Async(e) => e.next(),
        }
    }

    pub(crate) fn close(&mut self) {
        match self {
            Enumerator::Sync(e) => e.close(),
            Enumerator::Async(e) => e.close(),
        }
    }
}

struct Entry {
    /// Out of the table while its `next` runs.
    enumerator: Option<Enumerator>,
    _handle: Persistent<v8::Object>,
}

#[derive(Default)]
pub(crate) struct EnumeratorTable {
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

impl EnumeratorTable {
    fn take(&mut self, id: u64) -> Option<Enumerator> {
        self.entries.get_mut(&id)?.enumerator.take()
    }

    /// Put an enumerator back after a step; hands it back if the entry is gone.
    fn restore(&mut self, id: u64, enumerator: Enumerator) -> Option<Enumerator> {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.enumerator = Some(enumerator);
                None
            }
            None => Some(enumerator),
        }
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Enumerator> {
        self.entries.remove(&id)?.enumerator
    }

    pub(crate) fn take_all(&mut self) -> Vec<Enumerator> {
        self.entries.drain().filter_map(|(_, entry)| entry.enumerator).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(super) fn iterator_callback(
    scope: &mut v8::PinScope<'_, '_>,
    args: v8::FunctionCallbackArguments<'_>,
    mut rv: v8::ReturnValue<v8::Value>,
) {
    let Some(upcall) = Upcall::new(scope, args.this()) else {
        exception::throw_error(scope, "The object is not a host object", true);
        return;
    };
    let Some(enumerator) = upcall.call(scope, |target| target.enumerator()) else {
        return;
    };
    let Some(enumerator) = enumerator else {
        exception::throw_error(scope, "The object is not iterable", true);
        return;
    };
    if let Some(iterator) = new_iterator(scope, &upcall.cx, Enumerator::Sync(enumerator), false) {
        rv.set(iterator.into());
    }
}

/// Prefers the host's async enumerator; a sync one is adapted.
pub(super) fn async_iterator_callback(
    scope: &mut v8::PinScope<'_, '_>,
    args: v8::FunctionCallbackArguments<'_>,
    mut rv: v8::ReturnValue<v8::Value>,
) {
    let Some(upcall) = Upcall::new(scope, args.this()) else {
        exception::throw_error(scope, "The object is not a host object", true);
        return;
    };
    let Some(enumerator) = upcall.call(scope, |target| {
        Ok(match target.async_enumerator()? {
            Some(e) => Some(Enumerator::Async(e)),
            None => target.enumerator()?.map(Enumerator::Sync),
        })
    }) else {
        return;
    };
    let Some(enumerator) = enumerator else {
        exception::throw_error(scope, "The object is not async iterable", true);
        return;
    };
    if let Some(iterator) = new_iterator(scope, &upcall.cx, enumerator, true) {
        rv.set(iterator.into());
    }
}

fn new_iterator<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    enumerator: Enumerator,
    asynchronous: bool,
) -> Option<v8::Local<'s, v8::Object>> {
    let state = cx.state().ok()?;
    let id = {
        let mut table = state.enumerators.borrow_mut();
        table.next_id += 1;
        table.next_id
    };

    let data: v8::Local<v8::Value> = v8::Number::new(scope, id as f64).into();
    let (next, done) = if asynchronous {
        (
            v8::Function::builder(next_async).data(data).build(scope)?,
            v8::Function::builder(return_async).data(data).build(scope)?,
        )
    } else {
        (
            v8::Function::builder(next_sync).data(data).build(scope)?,
            v8::Function::builder(return_sync).data(data).build(scope)?,
        )
    };
    let this = v8::Function::builder(return_this).build(scope)?;

    let iterator = v8::Object::new(scope);
    let key = v8::String::new(scope, "next")?;
    iterator.set(scope, key.into(), next.into())?;
    let key = v8::String::new(scope, "return")?;
    iterator.set(scope, key.into(), done.into())?;
    let key = if asynchronous {
        v8::Symbol::get_async_iterator(scope)
    } else {
        v8::Symbol::get_iterator(scope)
    };
    iterator.set(scope, key.into(), this.into())?;

    let mut handle = Persistent::new(scope, iterator);
    let releases = cx.releases.clone();
    handle.set_weak(scope, move |_| releases.lock().push(PendingRelease::Enumerator(id)));
    state.enumerators.borrow_mut().entries.insert(
        id,
        Entry {
            enumerator: Some(enumerator),
            _handle: handle,
        },
    );
    Some(iterator)
}

fn entry_id(scope: &mut v8::PinScope<'_, '_>, args: &v8::FunctionCallbackArguments<'_>) -> Option<u64> {
    args.data().number_value(scope).map(|id| id as u64)
}

/// Advance enumerator `id`. An exhausted or failed enumerator is closed and
/// forgotten; later steps report `done`.
fn step(cx: &ContextInner, state: &ContextState, id: u64) -> Option<Result<Option<Value>, HostError>> {
    let Some(mut enumerator) = state.enumerators.borrow_mut().take(id) else {
        return Some(Ok(None));
    };
    let result = guarded(cx, || enumerator.next());

    let leftover = match &result {
        Some(Ok(Some(_))) => state.enumerators.borrow_mut().restore(id, enumerator),
        _ => {
            state.enumerators.borrow_mut().remove(id);
            Some(enumerator)
        }
    };
    if let Some(mut enumerator) = leftover {
        enumerator.close();
    }
    result
}

fn iter_result<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    value: Option<Value>,
) -> Result<v8::Local<'s, v8::Object>, Error> {
    let done = value.is_none();
    let value = match value {
        Some(value) => marshal::import_value(scope, cx, state, &value)?,
        None => v8::undefined(scope).into(),
    };
    let result = v8::Object::new(scope);
    let failed = || Error::general("Failed to build an iterator result");
    let key = v8::String::new(scope, "value").ok_or_else(failed)?;
    result.set(scope, key.into(), value).ok_or_else(failed)?;
    let key = v8::String::new(scope, "done").ok_or_else(failed)?;
    let done = v8::Boolean::new(scope, done);
    result.set(scope, key.into(), done.into()).ok_or_else(failed)?;
    Ok(result)
}

fn next_sync(scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    let Some(cx) = ContextInner::from_scope(scope) else {
        return;
    };
    let (Ok(state), Some(id)) = (cx.state(), entry_id(scope, &args)) else {
        return;
    };
    match step(&cx, state, id) {
        None => {}
        Some(Err(error)) => exception::throw_host_error(scope, &cx, error),
        Some(Ok(value)) => match iter_result(scope, &cx, state, value) {
            Ok(result) => rv.set(result.into()),
            Err(error) => exception::throw_error(scope, &error.to_string(), false),
        },
    }
}

fn next_async(scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    let Some(cx) = ContextInner::from_scope(scope) else {
        return;
    };
    let (Ok(state), Some(id)) = (cx.state(), entry_id(scope, &args)) else {
        return;
    };
    let Some(resolver) = v8::PromiseResolver::new(scope) else {
        return;
    };
    match step(&cx, state, id) {
        None => return,
        Some(Err(error)) => {
            let reason = exception::host_error_value(scope, &cx, state, error);
            resolver.reject(scope, reason);
        }
        Some(Ok(value)) => match iter_result(scope, &cx, state, value) {
            Ok(result) => {
                resolver.resolve(scope, result.into());
            }
            Err(error) => {
                let message = v8::String::new(scope, &error.to_string()).unwrap_or_else(|| v8::String::empty(scope));
                let reason = v8::Exception::error(scope, message);
                resolver.reject(scope, reason);
            }
        },
    }
    rv.set(resolver.get_promise(scope).into());
}

fn finish(scope: &mut v8::PinScope<'_, '_>, args: &v8::FunctionCallbackArguments<'_>) -> Option<(std::sync::Arc<ContextInner>, u64)> {
    let cx = ContextInner::from_scope(scope)?;
    let id = entry_id(scope, args)?;
    let removed = cx.state().ok()?.enumerators.borrow_mut().remove(id);
    if let Some(mut enumerator) = removed {
        enumerator.close();
    }
    Some((cx, id))
}

fn return_sync(scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    let Some((cx, _)) = finish(scope, &args) else {
        return;
    };
    let Ok(state) = cx.state() else {
        return;
    };
    if let Ok(result) = iter_result(scope, &cx, state, None) {
        rv.set(result.into());
    }
}

fn return_async(scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    let Some((cx, _)) = finish(scope, &args) else {
        return;
    };
    let (Ok(state), Some(resolver)) = (cx.state(), v8::PromiseResolver::new(scope)) else {
        return;
    };
    if let Ok(result) = iter_result(scope, &cx, state, None) {
        resolver.resolve(scope, result.into());
    }
    rv.set(resolver.get_promise(scope).into());
}

fn return_this(_scope: &mut v8::PinScope<'_, '_>, args: v8::FunctionCallbackArguments<'_>, mut rv: v8::ReturnValue<v8::Value>) {
    rv.set(args.this().into());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::host::{HostEnumerator, HostObject};
    use crate::{ContextOptions, DocumentInfo, HostError, HostObjectHolder, V8Isolate, Value};

    struct Range {
        limit: i32,
        closed: Arc<AtomicBool>,
    }

    struct Counter {
        at: i32,
        limit: i32,
        closed: Arc<AtomicBool>,
    }

    impl HostEnumerator for Counter {
        fn next(&mut self) -> Result<Option<Value>, HostError> {
            if self.at == self.limit {
                return Ok(None);
            }
            self.at += 1;
            Ok(Some(Value::Int32(self.at)))
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl HostObject for Range {
        fn enumerator(&self) -> Result<Option<Box<dyn HostEnumerator>>, HostError> {
            Ok(Some(Box::new(Counter {
                at: 0,
                limit: self.limit,
                closed: self.closed.clone(),
            })))
        }
    }

    fn range(limit: i32) -> (HostObjectHolder, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let holder = HostObjectHolder::from_object(Range {
            limit,
            closed: closed.clone(),
        });
        (holder, closed)
    }

    #[test]
    fn for_of_walks_the_host_enumerator() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();
        let (holder, closed) = range(4);
        context.set_global_property("r", Value::HostObject(holder), false).unwrap();

        let sum = context
            .execute(&DocumentInfo::script("iter.js"), "let s = 0; for (const x of r) s += x; s", true)
            .unwrap();
        assert_eq!(sum, Value::Int32(10));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn breaking_out_closes_the_enumerator() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();
        let (holder, closed) = range(100);
        context.set_global_property("r", Value::HostObject(holder), false).unwrap();

        let first = context
            .execute(&DocumentInfo::script("iter.js"), "let f; for (const x of r) { f = x; break; } f", true)
            .unwrap();
        assert_eq!(first, Value::Int32(1));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn sync_enumerators_serve_for_await() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();
        let (holder, _) = range(3);
        context.set_global_property("r", Value::HostObject(holder), false).unwrap();

        context
            .execute(
                &DocumentInfo::script("iter.js"),
                "globalThis.out = []; (async () => { for await (const x of r) out.push(x) })()",
                false,
            )
            .unwrap();
        let joined = context
            .execute(&DocumentInfo::script("iter.js"), "out.join()", true)
            .unwrap();
        assert_eq!(joined, Value::string("1,2,3"));
    }
}
