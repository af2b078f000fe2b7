//! The global object and the global-members stack.
//!
//! The global template carries `NON_MASKING` interceptors: V8 consults the
//! real global first and only asks us about names it cannot find there. We
//! then try each global member, most recently pushed first. Deletes are not
//! intercepted and only ever touch the real global.

use super::{ContextInner, ContextState, GlobalMember, V8Context};
use crate::error::Error;
use crate::marshal;
use crate::value::Value;

pub(super) fn global_template<'s>(scope: &mut v8::PinScope<'s, '_, ()>) -> v8::Local<'s, v8::ObjectTemplate> {
    let template = v8::ObjectTemplate::new(scope);
    template.set_named_property_handler(
        v8::NamedPropertyHandlerConfiguration::new()
            .getter(named_getter)
            .setter(named_setter)
            .query(named_query)
            .enumerator(named_enumerator)
            .flags(v8::PropertyHandlerFlags::NON_MASKING | v8::PropertyHandlerFlags::ONLY_INTERCEPT_STRINGS),
    );
    template.set_indexed_property_handler(
        v8::IndexedPropertyHandlerConfiguration::new()
            .getter(indexed_getter)
            .setter(indexed_setter)
            .query(indexed_query)
            .flags(v8::PropertyHandlerFlags::NON_MASKING),
    );
    template
}

/// Global members, most recent first.
fn members<'s>(scope: &mut v8::PinScope<'s, '_>) -> Vec<v8::Local<'s, v8::Object>> {
    let Some(cx) = ContextInner::from_scope(scope) else {
        return Vec::new();
    };
    let Ok(state) = cx.state() else {
        return Vec::new();
    };
    // Copied out: member lookups can run host code that pushes members.
    let members = state.global_members.borrow();
    members
        .iter()
        .rev()
        .map(|member| v8::Local::new(scope, &member.object))
        .collect()
}

fn named_getter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    key: v8::Local<'s, v8::Name>,
    _args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Value>,
) -> v8::Intercepted {
    for member in members(scope) {
        match member.has(scope, key.into()) {
            Some(false) => continue,
            Some(true) => {
                if let Some(value) = member.get(scope, key.into()) {
                    rv.set(value);
                }
                return v8::Intercepted::Yes;
            }
            // exception pending
            None => return v8::Intercepted::Yes,
        }
    }
    v8::Intercepted::No
}

fn named_setter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    key: v8::Local<'s, v8::Name>,
    value: v8::Local<'s, v8::Value>,
    _args: v8::PropertyCallbackArguments<'s>,
    _rv: v8::ReturnValue<()>,
) -> v8::Intercepted {
    for member in members(scope) {
        match member.has(scope, key.into()) {
            Some(false) => continue,
            Some(true) => {
                member.set(scope, key.into(), value);
                return v8::Intercepted::Yes;
            }
            None => return v8::Intercepted::Yes,
        }
    }
    v8::Intercepted::No
}

fn named_query<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    key: v8::Local<'s, v8::Name>,
    _args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Integer>,
) -> v8::Intercepted {
    for member in members(scope) {
        match member.has(scope, key.into()) {
            Some(false) => continue,
            Some(true) => {
                rv.set_int32(v8::PropertyAttribute::NONE.as_u32() as i32);
                return v8::Intercepted::Yes;
            }
            None => return v8::Intercepted::Yes,
        }
    }
    v8::Intercepted::No
}

fn named_enumerator<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    _args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Array>,
) {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for member in members(scope) {
        let Some(keys) = member.get_property_names(
            scope,
            v8::GetPropertyNamesArgs {
                mode: v8::KeyCollectionMode::IncludePrototypes,
                property_filter: v8::PropertyFilter::ONLY_ENUMERABLE | v8::PropertyFilter::SKIP_SYMBOLS,
                index_filter: v8::IndexFilter::SkipIndices,
                key_conversion: v8::KeyConversionMode::ConvertToString,
            },
        ) else {
            return;
        };
        for i in 0..keys.length() {
            let Some(key) = keys.get_index(scope, i) else {
                return;
            };
            if seen.insert(key.to_rust_string_lossy(scope)) {
                names.push(key);
            }
        }
    }
    rv.set(v8::Array::new_with_elements(scope, &names));
}

fn indexed_getter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    index: u32,
    _args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Value>,
) -> v8::Intercepted {
    for member in members(scope) {
        match member.has_index(scope, index) {
            Some(false) => continue,
            Some(true) => {
                if let Some(value) = member.get_index(scope, index) {
                    rv.set(value);
                }
                return v8::Intercepted::Yes;
            }
            None => return v8::Intercepted::Yes,
        }
    }
    v8::Intercepted::No
}

fn indexed_setter<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    index: u32,
    value: v8::Local<'s, v8::Value>,
    _args: v8::PropertyCallbackArguments<'s>,
    _rv: v8::ReturnValue<()>,
) -> v8::Intercepted {
    for member in members(scope) {
        match member.has_index(scope, index) {
            Some(false) => continue,
            Some(true) => {
                member.set_index(scope, index, value);
                return v8::Intercepted::Yes;
            }
            None => return v8::Intercepted::Yes,
        }
    }
    v8::Intercepted::No
}

fn indexed_query<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    index: u32,
    _args: v8::PropertyCallbackArguments<'s>,
    mut rv: v8::ReturnValue<v8::Integer>,
) -> v8::Intercepted {
    for member in members(scope) {
        if member.has_index(scope, index) == Some(true) {
            rv.set_int32(v8::PropertyAttribute::NONE.as_u32() as i32);
            return v8::Intercepted::Yes;
        }
    }
    v8::Intercepted::No
}

impl V8Context {
    pub fn get_global_property(&self, name: &str) -> Result<Value, Error> {
        let cx = &self.inner;
        cx.with_scope(|scope, state| {
            marshal::try_catch(scope, cx, state, |tc| {
                let global = tc.get_current_context().global(tc);
                let key = v8::String::new(tc, name)?;
                let value = global.get(tc, key.into())?;
                if value.is_undefined() && !global.has(tc, key.into())? {
                    return Some(Value::Nonexistent);
                }
                Some(marshal::export_value(tc, cx, state, value))
            })
        })
    }

    /// Assign `global[name] = value`.
    ///
    /// With `global_members`, an object value is also pushed on the
    /// global-members stack (replacing any member of the same name), so its
    /// properties resolve as globals.
    pub fn set_global_property(&self, name: &str, value: Value, global_members: bool) -> Result<(), Error> {
        let cx = &self.inner;
        cx.with_scope(|scope, state| {
            let imported = marshal::import_value(scope, cx, state, &value)?;
            marshal::try_catch(scope, cx, state, |tc| {
                let global = tc.get_current_context().global(tc);
                let key = v8::String::new(tc, name)?;
                global.set(tc, key.into(), imported).map(|_| ())
            })?;

            if global_members {
                push_member(scope, state, name, imported);
            }
            Ok(())
        })
    }

    /// Delete from the real global; members are unaffected.
    pub fn delete_global_property(&self, name: &str) -> Result<bool, Error> {
        let cx = &self.inner;
        cx.with_scope(|scope, state| {
            marshal::try_catch(scope, cx, state, |tc| {
                let global = tc.get_current_context().global(tc);
                let key = v8::String::new(tc, name)?;
                global.delete(tc, key.into())
            })
        })
    }

    pub fn global_property_names(&self, include_indices: bool) -> Result<Vec<String>, Error> {
        self.get_root_object()?.property_names(include_indices)
    }

    /// Names on the global-members stack, oldest first.
    pub fn get_global_members(&self) -> Result<Vec<String>, Error> {
        let cx = &self.inner;
        cx.isolate.with_lock(|_| {
            let state = cx.state()?;
            let names = state.global_members.borrow().iter().map(|m| m.name.clone()).collect();
            Ok(names)
        })
    }
}

fn push_member(scope: &mut v8::PinScope<'_, '_>, state: &ContextState, name: &str, value: v8::Local<'_, v8::Value>) {
    let mut members = state.global_members.borrow_mut();
    members.retain(|member| member.name != name);
    if let Ok(object) = v8::Local::<v8::Object>::try_from(value) {
        members.push(GlobalMember {
            name: name.to_string(),
            object: v8::Global::new(scope, object),
        });
    }
}
