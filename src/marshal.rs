//! Value marshalling between the host and V8.
//!
//! Import (host → V8) can fail: strings too long for V8, objects from another
//! isolate. Export (V8 → host) cannot; anything without a better mapping
//! becomes a [`V8Object`] holder.

use crate::context::{ContextInner, ContextState};
use crate::error::{Error, ScriptError};
use crate::holder::{SharedObjectInfo, V8Object};
use crate::host_object::{self, exception};
use crate::value::{BigIntValue, JsString, Value, ValueFlags, ValueSubtype};

/// Run `f` under a `TryCatch` and turn a failure into an [`Error`].
///
/// `f` returns `None` when a V8 call failed; the caught exception (or the
/// pending termination) decides the error kind.
pub(crate) fn try_catch<'s, R>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    f: impl FnOnce(&mut v8::PinScope<'s, '_>) -> Option<R>,
) -> Result<R, Error> {
    let tc = std::pin::pin!(v8::TryCatch::new(scope));
    let mut tc = tc.init();

    if let Some(value) = f(&mut tc) {
        if !tc.has_caught() {
            return Ok(value);
        }
    }

    if tc.has_terminated() || cx.isolate.is_execution_terminating() {
        return Err(if cx.isolate.out_of_memory() {
            Error::OutOfMemory
        } else {
            Error::interrupted()
        });
    }

    let Some(exception) = tc.exception() else {
        return Err(Error::general("Script execution failed"));
    };

    if let Some(host_error) = exception::take_host_error(&mut tc, state, exception) {
        return Err(Error::Host(host_error));
    }

    let message = exception
        .to_string(&mut tc)
        .map(|s| s.to_rust_string_lossy(&mut tc))
        .or_else(|| tc.message().map(|m| m.get(&mut tc).to_rust_string_lossy(&mut tc)))
        .unwrap_or_else(|| "Script execution failed".to_string());
    let stack_trace = tc
        .stack_trace()
        .and_then(|stack| stack.to_string(&mut tc))
        .map(|stack| stack.to_rust_string_lossy(&mut tc));

    let exception = export_value(&mut tc, cx, state, exception);
    Err(Error::General(ScriptError {
        message,
        stack_trace,
        exception: Some(exception),
        ..ScriptError::new(String::new())
    }))
}

pub(crate) fn import_value<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    value: &Value,
) -> Result<v8::Local<'s, v8::Value>, Error> {
    let imported: v8::Local<v8::Value> = match value {
        Value::Nonexistent | Value::Undefined => v8::undefined(scope).into(),
        Value::Null => v8::null(scope).into(),
        Value::Boolean(b) => v8::Boolean::new(scope, *b).into(),
        Value::Number(n) => v8::Number::new(scope, *n).into(),
        Value::Int32(n) => v8::Integer::new(scope, *n).into(),
        Value::UInt32(n) => v8::Integer::new_from_unsigned(scope, *n).into(),
        Value::String(s) => v8::String::new_from_two_byte(scope, s.as_utf16(), v8::NewStringType::Normal)
            .ok_or_else(|| Error::general("RangeError: Invalid string length"))?
            .into(),
        Value::DateTime(ms) => v8::Date::new(scope, *ms)
            .ok_or_else(|| Error::general("RangeError: Invalid time value"))?
            .into(),
        Value::BigInt(b) => {
            let words: &[u64] = if b.words.is_empty() { &[0] } else { &b.words };
            v8::BigInt::new_from_words(scope, b.negative, words)
                .ok_or_else(|| Error::general("RangeError: Maximum BigInt size exceeded"))?
                .into()
        }
        Value::V8Object(object) => {
            if !object.is_from(&cx.isolate) {
                return Err(Error::ProxyFailure(
                    "The object belongs to a different V8 isolate".to_string(),
                ));
            }
            v8::Local::new(scope, object.global()).into()
        }
        Value::HostObject(holder) => host_object::wrap(scope, cx, state, holder)?.into(),
    };
    Ok(imported)
}

/// Import every argument before anything runs.
pub(crate) fn import_args<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    cx: &ContextInner,
    state: &ContextState,
    args: &[Value],
) -> Result<Vec<v8::Local<'s, v8::Value>>, Error> {
    args.iter().map(|arg| import_value(scope, cx, state, arg)).collect()
}

pub(crate) fn export_value(
    scope: &mut v8::PinScope<'_, '_>,
    cx: &ContextInner,
    state: &ContextState,
    value: v8::Local<'_, v8::Value>,
) -> Value {
    if value.is_undefined() {
        return Value::Undefined;
    }
    if value.is_null() {
        return Value::Null;
    }
    if value.is_boolean() {
        return Value::Boolean(value.is_true());
    }
    if value.is_number() {
        // -0 is not an int32 to V8, so it stays a Number
        if value.is_int32() {
            return Value::Int32(value.int32_value(scope).unwrap_or_default());
        }
        if value.is_uint32() {
            return Value::UInt32(value.uint32_value(scope).unwrap_or_default());
        }
        return Value::Number(value.number_value(scope).unwrap_or(f64::NAN));
    }
    if let Ok(s) = v8::Local::<v8::String>::try_from(value) {
        return Value::String(export_string(scope, s));
    }
    if let Ok(b) = v8::Local::<v8::BigInt>::try_from(value) {
        let mut words = vec![0u64; b.word_count()];
        let (negative, words) = b.to_words_array(&mut words);
        return Value::BigInt(BigIntValue::new(negative, words.to_vec()));
    }
    if cx.options.enable_date_time_conversion {
        if let Ok(date) = v8::Local::<v8::Date>::try_from(value) {
            return Value::DateTime(date.value_of());
        }
    }

    let Ok(object) = v8::Local::<v8::Object>::try_from(value) else {
        // symbols
        return Value::Undefined;
    };
    if let Some(holder) = host_object::unwrap(scope, state, object) {
        return Value::HostObject(holder);
    }

    let (subtype, flags) = classify(value);
    let shared = if subtype.is_array_buffer_or_view() {
        shared_info(scope, object)
    } else {
        None
    };
    Value::V8Object(V8Object::new(scope, cx, object, subtype, flags, shared))
}

pub(crate) fn export_string(scope: &mut v8::PinScope<'_, '_>, s: v8::Local<'_, v8::String>) -> JsString {
    let mut units = vec![0u16; s.length()];
    s.write_v2(scope, 0, &mut units, v8::WriteFlags::empty());
    JsString::from_utf16(units)
}

fn classify(value: v8::Local<'_, v8::Value>) -> (ValueSubtype, ValueFlags) {
    let mut flags = ValueFlags::empty();
    let subtype = if value.is_function() {
        if value.is_async_function() {
            flags |= ValueFlags::ASYNC;
        }
        if value.is_generator_function() {
            flags |= ValueFlags::GENERATOR;
        }
        ValueSubtype::Function
    } else if value.is_generator_object() {
        flags |= ValueFlags::GENERATOR;
        ValueSubtype::Iterator
    } else if value.is_map_iterator() || value.is_set_iterator() {
        ValueSubtype::Iterator
    } else if value.is_promise() {
        ValueSubtype::Promise
    } else if value.is_array() {
        ValueSubtype::Array
    } else if value.is_array_buffer() {
        ValueSubtype::ArrayBuffer
    } else if value.is_shared_array_buffer() {
        flags |= ValueFlags::SHARED;
        ValueSubtype::ArrayBuffer
    } else if value.is_data_view() {
        ValueSubtype::DataView
    } else if value.is_typed_array() {
        typed_array_subtype(value)
    } else {
        ValueSubtype::None
    };
    (subtype, flags)
}

fn typed_array_subtype(value: v8::Local<'_, v8::Value>) -> ValueSubtype {
    if value.is_uint8_array() {
        ValueSubtype::Uint8Array
    } else if value.is_uint8_clamped_array() {
        ValueSubtype::Uint8ClampedArray
    } else if value.is_int8_array() {
        ValueSubtype::Int8Array
    } else if value.is_uint16_array() {
        ValueSubtype::Uint16Array
    } else if value.is_int16_array() {
        ValueSubtype::Int16Array
    } else if value.is_uint32_array() {
        ValueSubtype::Uint32Array
    } else if value.is_int32_array() {
        ValueSubtype::Int32Array
    } else if value.is_big_uint64_array() {
        ValueSubtype::BigUint64Array
    } else if value.is_big_int64_array() {
        ValueSubtype::BigInt64Array
    } else if value.is_float32_array() {
        ValueSubtype::Float32Array
    } else if value.is_float64_array() {
        ValueSubtype::Float64Array
    } else {
        // Float16Array and friends
        ValueSubtype::None
    }
}

fn shared_info(scope: &mut v8::PinScope<'_, '_>, object: v8::Local<'_, v8::Object>) -> Option<SharedObjectInfo> {
    if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(object) {
        let size = buffer.byte_length();
        return Some(SharedObjectInfo::new(buffer.get_backing_store(), 0, size, size));
    }
    if let Ok(buffer) = v8::Local::<v8::SharedArrayBuffer>::try_from(object) {
        let size = buffer.byte_length();
        return Some(SharedObjectInfo::new(buffer.get_backing_store(), 0, size, size));
    }
    let view = v8::Local::<v8::ArrayBufferView>::try_from(object).ok()?;
    let buffer = view.buffer(scope)?;
    let offset = view.byte_offset();
    let size = view.byte_length();
    let length = match v8::Local::<v8::TypedArray>::try_from(object) {
        Ok(typed) => typed.length(),
        Err(_) => size,
    };
    Some(SharedObjectInfo::new(buffer.get_backing_store(), offset, size, length))
}

#[cfg(test)]
mod tests {
    use crate::{ContextOptions, DocumentInfo, JsString, V8Isolate, Value, ValueFlags, ValueSubtype};

    fn eval(context: &crate::V8Context, code: &str) -> Value {
        context.execute(&DocumentInfo::script("marshal.js"), code, true).unwrap()
    }

    #[test]
    fn numbers_pick_the_narrowest_kind() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();

        assert_eq!(eval(&context, "-5"), Value::Int32(-5));
        assert_eq!(eval(&context, "4294967295"), Value::UInt32(u32::MAX));
        assert_eq!(eval(&context, "-0"), Value::Number(-0.0));
        assert_eq!(eval(&context, "1.5"), Value::Number(1.5));
        assert_eq!(eval(&context, "2 ** 53"), Value::Number(9007199254740992.0));
    }

    #[test]
    fn lone_surrogates_survive_export() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();

        let value = eval(&context, "'\\uD800x'");
        assert_eq!(value, Value::String(JsString::from_utf16(vec![0xD800, b'x' as u16])));
    }

    #[test]
    fn dates_follow_the_context_option() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let plain = isolate.create_context(ContextOptions::default()).unwrap();
        let converting = isolate
            .create_context(ContextOptions::default().enable_date_time_conversion(true))
            .unwrap();

        assert_eq!(eval(&converting, "new Date(86400000)"), Value::DateTime(86400000.0));
        assert!(matches!(eval(&plain, "new Date(0)"), Value::V8Object(_)));
    }

    #[test]
    fn objects_carry_subtype_and_flags() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();

        let f = eval(&context, "(async function () {})");
        assert_eq!(f.subtype(), ValueSubtype::Function);
        assert_eq!(f.flags(), ValueFlags::ASYNC);

        let g = eval(&context, "(function* () {})()");
        assert_eq!(g.subtype(), ValueSubtype::Iterator);
        assert_eq!(g.flags(), ValueFlags::GENERATOR);

        assert_eq!(eval(&context, "Promise.resolve(1)").subtype(), ValueSubtype::Promise);
        assert_eq!(eval(&context, "[1, 2]").subtype(), ValueSubtype::Array);
        assert_eq!(eval(&context, "new Float64Array(2)").subtype(), ValueSubtype::Float64Array);
        assert_eq!(eval(&context, "new SharedArrayBuffer(8)").flags(), ValueFlags::SHARED);
    }

    #[test]
    fn typed_array_views_expose_their_window() {
        let isolate = V8Isolate::with_defaults().unwrap();
        let context = isolate.create_context(ContextOptions::default()).unwrap();

        let value = eval(&context, "new Uint16Array(new ArrayBuffer(16), 4, 3).fill(0x0101)");
        let Value::V8Object(view) = value else {
            panic!("expected an object");
        };
        let info = view.shared_info().unwrap();
        assert_eq!((info.offset, info.size, info.length), (4, 6, 3));

        let sum: u32 = view.with_array_buffer_data(|bytes| bytes.iter().map(|b| *b as u32).sum()).unwrap();
        assert_eq!(sum, 6);
    }

    #[test]
    fn cross_isolate_objects_are_refused() {
        let a = V8Isolate::with_defaults().unwrap();
        let b = V8Isolate::with_defaults().unwrap();
        let ca = a.create_context(ContextOptions::default()).unwrap();
        let cb = b.create_context(ContextOptions::default()).unwrap();

        let object = eval(&ca, "({})");
        assert!(matches!(
            cb.set_global_property("o", object, false),
            Err(crate::Error::ProxyFailure(_))
        ));
    }
}
