//! The tagged value that crosses the host/V8 boundary.

use std::fmt;

use crate::holder::{HostObjectHolder, V8Object};

/// Narrows a [`Value::V8Object`] to a well-known JavaScript kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ValueSubtype {
    #[default]
    None = 0,
    Function,
    Iterator,
    Promise,
    Array,
    ArrayBuffer,
    DataView,
    Uint8Array,
    Uint8ClampedArray,
    Int8Array,
    Uint16Array,
    Int16Array,
    Uint32Array,
    Int32Array,
    BigUint64Array,
    BigInt64Array,
    Float32Array,
    Float64Array,
}

impl ValueSubtype {
    pub fn is_typed_array(self) -> bool {
        (self as u8) >= (ValueSubtype::Uint8Array as u8)
    }

    pub fn is_array_buffer_or_view(self) -> bool {
        matches!(self, ValueSubtype::ArrayBuffer | ValueSubtype::DataView) || self.is_typed_array()
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        use ValueSubtype::*;
        const ALL: [ValueSubtype; 18] = [
            None,
            Function,
            Iterator,
            Promise,
            Array,
            ArrayBuffer,
            DataView,
            Uint8Array,
            Uint8ClampedArray,
            Int8Array,
            Uint16Array,
            Int16Array,
            Uint32Array,
            Int32Array,
            BigUint64Array,
            BigInt64Array,
            Float32Array,
            Float64Array,
        ];
        ALL.get(raw as usize).copied()
    }
}

bitflags::bitflags! {
    /// Annotations on a V8 object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ValueFlags: u16 {
        const SHARED = 1 << 0;
        const ASYNC = 1 << 1;
        const GENERATOR = 1 << 2;
    }
}

/// A JavaScript string as UTF-16 code units.
///
/// Kept as raw code units so that unpaired surrogates survive the trip through
/// the host untouched.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct JsString(Vec<u16>);

impl JsString {
    pub fn from_utf16(units: Vec<u16>) -> Self {
        Self(units)
    }

    pub fn as_utf16(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy conversion; lone surrogates become U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for JsString {
    fn from(s: &str) -> Self {
        Self(s.encode_utf16().collect())
    }
}

impl From<String> for JsString {
    fn from(s: String) -> Self {
        JsString::from(s.as_str())
    }
}

impl fmt::Debug for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_string_lossy(), f)
    }
}

impl fmt::Display for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/// Arbitrary precision integer: sign bit plus little-endian 64-bit magnitude words.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BigIntValue {
    pub negative: bool,
    pub words: Vec<u64>,
}

impl BigIntValue {
    pub fn new(negative: bool, mut words: Vec<u64>) -> Self {
        while words.last() == Some(&0) {
            words.pop();
        }
        // zero has no sign
        let negative = negative && !words.is_empty();
        Self { negative, words }
    }

    pub fn to_i128(&self) -> Option<i128> {
        let magnitude = match self.words.as_slice() {
            [] => 0u128,
            [lo] => *lo as u128,
            [lo, hi] => ((*hi as u128) << 64) | *lo as u128,
            _ => return None,
        };
        if self.negative {
            if magnitude == 1u128 << 127 {
                return Some(i128::MIN);
            }
            i128::try_from(magnitude).ok().map(|m| -m)
        } else {
            i128::try_from(magnitude).ok()
        }
    }
}

impl From<i128> for BigIntValue {
    fn from(v: i128) -> Self {
        let magnitude = v.unsigned_abs();
        BigIntValue::new(v < 0, vec![magnitude as u64, (magnitude >> 64) as u64])
    }
}

impl From<i64> for BigIntValue {
    fn from(v: i64) -> Self {
        BigIntValue::from(v as i128)
    }
}

impl From<u64> for BigIntValue {
    fn from(v: u64) -> Self {
        BigIntValue::new(false, vec![v])
    }
}

/// Discriminant of a [`Value`]. The numbering is the wire `type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Nonexistent = 0,
    Undefined,
    Null,
    Boolean,
    Number,
    Int32,
    UInt32,
    String,
    DateTime,
    BigInt,
    V8Object,
    HostObject,
}

impl ValueType {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        use ValueType::*;
        const ALL: [ValueType; 12] = [
            Nonexistent,
            Undefined,
            Null,
            Boolean,
            Number,
            Int32,
            UInt32,
            String,
            DateTime,
            BigInt,
            V8Object,
            HostObject,
        ];
        ALL.get(raw as usize).copied()
    }
}

/// A value crossing the boundary.
///
/// `Nonexistent` is distinct from `Undefined`: it tells a property interceptor
/// that the host has no such member so the lookup may continue up the
/// prototype chain.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nonexistent,
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    Int32(i32),
    UInt32(u32),
    String(JsString),
    /// Milliseconds since the Unix epoch.
    DateTime(f64),
    BigInt(BigIntValue),
    V8Object(V8Object),
    HostObject(HostObjectHolder),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Nonexistent => ValueType::Nonexistent,
            Value::Undefined => ValueType::Undefined,
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::Int32(_) => ValueType::Int32,
            Value::UInt32(_) => ValueType::UInt32,
            Value::String(_) => ValueType::String,
            Value::DateTime(_) => ValueType::DateTime,
            Value::BigInt(_) => ValueType::BigInt,
            Value::V8Object(_) => ValueType::V8Object,
            Value::HostObject(_) => ValueType::HostObject,
        }
    }

    /// Subtype of a V8 object; `None` for everything else.
    pub fn subtype(&self) -> ValueSubtype {
        match self {
            Value::V8Object(obj) => obj.subtype(),
            _ => ValueSubtype::None,
        }
    }

    /// Flags of a V8 object; empty for everything else.
    pub fn flags(&self) -> ValueFlags {
        match self {
            Value::V8Object(obj) => obj.flags(),
            _ => ValueFlags::empty(),
        }
    }

    pub fn string(s: &str) -> Self {
        Value::String(JsString::from(s))
    }

    pub fn is_nonexistent(&self) -> bool {
        matches!(self, Value::Nonexistent)
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.to_string_lossy()),
            _ => None,
        }
    }

    /// Numeric view of any number-like variant.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Number(n) => Some(n),
            Value::Int32(n) => Some(n as f64),
            Value::UInt32(n) => Some(n as f64),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::Int32(n) => Some(n),
            Value::UInt32(n) => i32::try_from(n).ok(),
            Value::Number(n) if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 => {
                Some(n as i32)
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_v8_object(&self) -> Option<&V8Object> {
        match self {
            Value::V8Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_host_object(&self) -> Option<&HostObjectHolder> {
        match self {
            Value::HostObject(obj) => Some(obj),
            _ => None,
        }
    }
}

/// SameValue semantics for numbers (`NaN == NaN`, `-0 != +0`); identity for objects.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        fn same_value(a: f64, b: f64) -> bool {
            (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
        }

        match (self, other) {
            (Value::Nonexistent, Value::Nonexistent)
            | (Value::Undefined, Value::Undefined)
            | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => same_value(*a, *b),
            (Value::DateTime(a), Value::DateTime(b)) => same_value(*a, *b),
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::UInt32(a), Value::UInt32(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::V8Object(a), Value::V8Object(b)) => a.same_object(b),
            (Value::HostObject(a), Value::HostObject(b)) => a.same_target(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nonexistent => f.write_str("Nonexistent"),
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Boolean(b) => write!(f, "Boolean({b})"),
            Value::Number(n) => write!(f, "Number({n:?})"),
            Value::Int32(n) => write!(f, "Int32({n})"),
            Value::UInt32(n) => write!(f, "UInt32({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::DateTime(ms) => write!(f, "DateTime({ms})"),
            Value::BigInt(b) => write!(f, "BigInt({b:?})"),
            Value::V8Object(o) => write!(f, "V8Object({:?}, {:?})", o.subtype(), o.flags()),
            Value::HostObject(_) => f.write_str("HostObject"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(JsString::from(v))
    }
}

impl From<BigIntValue> for Value {
    fn from(v: BigIntValue) -> Self {
        Value::BigInt(v)
    }
}

impl From<HostObjectHolder> for Value {
    fn from(v: HostObjectHolder) -> Self {
        Value::HostObject(v)
    }
}
