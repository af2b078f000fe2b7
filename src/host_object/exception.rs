//! Host errors tunnelled through JavaScript.
//!
//! A `HostError` thrown into script becomes a JS `Error` tagged with a
//! private id. If the same object comes back out of a `TryCatch`, the tag
//! recovers the original `HostError`, so a throw/catch/rethrow round trip
//! preserves identity.

use std::collections::HashMap;

use crate::context::{ContextInner, ContextState, PendingRelease};
use crate::error::HostError;
use crate::handles::Persistent;

struct Entry {
    error: HostError,
    /// Weak; the entry goes once script drops the error object.
    _handle: Persistent<v8::Object>,
}

#[derive(Default)]
pub(crate) struct HostExceptionTable {
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

impl HostExceptionTable {
    pub(crate) fn get(&self, id: u64) -> Option<HostError> {
        self.entries.get(&id).map(|entry| entry.error.clone())
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<HostError> {
        self.entries.remove(&id).map(|entry| entry.error)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A JS `Error` standing for `error`.
pub(crate) fn host_error_value<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    error: HostError,
) -> v8::Local<'s, v8::Value> {
    let message = v8::String::new(scope, &error.to_string()).unwrap_or_else(|| v8::String::empty(scope));
    let exception = v8::Exception::error(scope, message);
    let Ok(object) = v8::Local::<v8::Object>::try_from(exception) else {
        return exception;
    };

    let id = {
        let mut table = state.host_exceptions.borrow_mut();
        table.next_id += 1;
        table.next_id
    };
    let private = v8::Local::new(scope, &state.privates.host_exception);
    let tag = v8::Number::new(scope, id as f64);
    object.set_private(scope, private, tag.into());

    let mut handle = Persistent::new(scope, object);
    let releases = cx.releases.clone();
    handle.set_weak(scope, move |_| releases.lock().push(PendingRelease::HostException(id)));
    state
        .host_exceptions
        .borrow_mut()
        .entries
        .insert(id, Entry { error, _handle: handle });
    exception
}

pub(crate) fn throw_host_error(scope: &mut v8::PinScope<'_, '_>, cx: &ContextInner, error: HostError) {
    let exception = match cx.state() {
        Ok(state) => host_error_value(scope, cx, state, error),
        Err(_) => {
            let message = v8::String::new(scope, &error.to_string()).unwrap_or_else(|| v8::String::empty(scope));
            v8::Exception::error(scope, message)
        }
    };
    scope.throw_exception(exception);
}

/// Throw a plain `Error` (or `TypeError`) with `message`.
pub(crate) fn throw_error(scope: &mut v8::PinScope<'_, '_>, message: &str, type_error: bool) {
    let message = v8::String::new(scope, message).unwrap_or_else(|| v8::String::empty(scope));
    let exception = if type_error {
        v8::Exception::type_error(scope, message)
    } else {
        v8::Exception::error(scope, message)
    };
    scope.throw_exception(exception);
}

/// The `HostError` behind a caught exception, if it is one of ours.
pub(crate) fn take_host_error(
    scope: &mut v8::PinScope<'_, '_>,
    state: &ContextState,
    exception: v8::Local<'_, v8::Value>,
) -> Option<HostError> {
    let object = v8::Local::<v8::Object>::try_from(exception).ok()?;
    let private = v8::Local::new(scope, &state.privates.host_exception);
    let tag = object.get_private(scope, private)?;
    if !tag.is_number() {
        return None;
    }
    let id = tag.number_value(scope)? as u64;
    state.host_exceptions.borrow().get(id)
}
