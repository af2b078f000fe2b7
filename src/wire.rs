//! Fixed 16-byte representation of a [`Value`].
//!
//! ```text
//! offset  size  field
//!   0      1    type            ValueType discriminant
//!   1      1    subtype         ValueSubtype (V8Object only)
//!   2      2    flags | sign    ValueFlags bits, or BigInt sign bit
//!   4      4    length | hash   string/word length, or object identity hash
//!   8      8    payload         inline scalar or side-table index
//! ```
//!
//! Scalars live in `payload`. Strings, big integers and object handles cannot
//! be flattened into 8 bytes, so they are parked in a [`WireTable`] and the
//! payload holds their index.

use std::mem::{offset_of, size_of};

use crate::value::{BigIntValue, JsString, Value, ValueFlags, ValueSubtype, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct WireValue {
    pub value_type: u8,
    pub subtype: u8,
    pub flags_or_sign: i16,
    pub length_or_hash: i32,
    pub payload: u64,
}

const _: () = {
    assert!(size_of::<WireValue>() == 16);
    assert!(offset_of!(WireValue, value_type) == 0);
    assert!(offset_of!(WireValue, subtype) == 1);
    assert!(offset_of!(WireValue, flags_or_sign) == 2);
    assert!(offset_of!(WireValue, length_or_hash) == 4);
    assert!(offset_of!(WireValue, payload) == 8);
};

/// Out-of-line storage for payloads that do not fit in a [`WireValue`].
#[derive(Default)]
pub struct WireTable {
    strings: Vec<JsString>,
    bigints: Vec<BigIntValue>,
    objects: Vec<Value>,
}

impl WireTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.strings.clear();
        self.bigints.clear();
        self.objects.clear();
    }
}

impl WireValue {
    pub fn value_type(&self) -> Option<ValueType> {
        ValueType::from_u8(self.value_type)
    }

    fn scalar(value_type: ValueType, payload: u64) -> Self {
        Self {
            value_type: value_type as u8,
            payload,
            ..Default::default()
        }
    }

    pub fn from_value(value: &Value, table: &mut WireTable) -> Self {
        match value {
            Value::Nonexistent => Self::scalar(ValueType::Nonexistent, 0),
            Value::Undefined => Self::scalar(ValueType::Undefined, 0),
            Value::Null => Self::scalar(ValueType::Null, 0),
            Value::Boolean(b) => Self::scalar(ValueType::Boolean, *b as u64),
            Value::Number(n) => Self::scalar(ValueType::Number, n.to_bits()),
            Value::Int32(n) => Self::scalar(ValueType::Int32, *n as u32 as u64),
            Value::UInt32(n) => Self::scalar(ValueType::UInt32, *n as u64),
            Value::DateTime(ms) => Self::scalar(ValueType::DateTime, ms.to_bits()),
            Value::String(s) => {
                table.strings.push(s.clone());
                Self {
                    value_type: ValueType::String as u8,
                    length_or_hash: s.len() as i32,
                    payload: (table.strings.len() - 1) as u64,
                    ..Default::default()
                }
            }
            Value::BigInt(b) => {
                table.bigints.push(b.clone());
                Self {
                    value_type: ValueType::BigInt as u8,
                    flags_or_sign: b.negative as i16,
                    length_or_hash: b.words.len() as i32,
                    payload: (table.bigints.len() - 1) as u64,
                    ..Default::default()
                }
            }
            Value::V8Object(obj) => {
                table.objects.push(value.clone());
                Self {
                    value_type: ValueType::V8Object as u8,
                    subtype: obj.subtype() as u8,
                    flags_or_sign: obj.flags().bits() as i16,
                    length_or_hash: obj.identity_hash(),
                    payload: (table.objects.len() - 1) as u64,
                }
            }
            Value::HostObject(_) => {
                table.objects.push(value.clone());
                Self::scalar(ValueType::HostObject, (table.objects.len() - 1) as u64)
            }
        }
    }

    /// Rebuilds the value; `None` when the record is malformed or refers past the table.
    pub fn to_value(&self, table: &WireTable) -> Option<Value> {
        let index = self.payload as usize;
        let value = match self.value_type()? {
            ValueType::Nonexistent => Value::Nonexistent,
            ValueType::Undefined => Value::Undefined,
            ValueType::Null => Value::Null,
            ValueType::Boolean => Value::Boolean(self.payload != 0),
            ValueType::Number => Value::Number(f64::from_bits(self.payload)),
            ValueType::Int32 => Value::Int32(self.payload as u32 as i32),
            ValueType::UInt32 => Value::UInt32(self.payload as u32),
            ValueType::DateTime => Value::DateTime(f64::from_bits(self.payload)),
            ValueType::String => Value::String(table.strings.get(index)?.clone()),
            ValueType::BigInt => Value::BigInt(table.bigints.get(index)?.clone()),
            ValueType::V8Object | ValueType::HostObject => {
                let value = table.objects.get(index)?.clone();
                if value.value_type() as u8 != self.value_type {
                    return None;
                }
                value
            }
        };
        Some(value)
    }

    pub fn subtype(&self) -> ValueSubtype {
        ValueSubtype::from_u8(self.subtype).unwrap_or_default()
    }

    pub fn flags(&self) -> ValueFlags {
        if self.value_type == ValueType::V8Object as u8 {
            ValueFlags::from_bits_truncate(self.flags_or_sign as u16)
        } else {
            ValueFlags::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_inline() {
        let mut table = WireTable::new();
        let w = WireValue::from_value(&Value::Int32(-7), &mut table);
        assert_eq!(w.value_type, ValueType::Int32 as u8);
        assert_eq!(w.to_value(&table), Some(Value::Int32(-7)));

        let w = WireValue::from_value(&Value::Number(-0.0), &mut table);
        assert_eq!(w.to_value(&table), Some(Value::Number(-0.0)));
        assert!(table.strings.is_empty());
    }

    #[test]
    fn bigint_sign_lives_in_flags_field() {
        let mut table = WireTable::new();
        let w = WireValue::from_value(&Value::BigInt(BigIntValue::from(-3i64)), &mut table);
        assert_eq!(w.flags_or_sign, 1);
        assert_eq!(w.length_or_hash, 1);
        assert_eq!(w.to_value(&table), Some(Value::BigInt(BigIntValue::from(-3i64))));
    }

    #[test]
    fn strings_record_length() {
        let mut table = WireTable::new();
        let w = WireValue::from_value(&Value::string("héllo"), &mut table);
        assert_eq!(w.length_or_hash, 5);
        assert_eq!(w.subtype(), ValueSubtype::None);
        assert!(w.flags().is_empty());
    }

    #[test]
    fn malformed_records_decode_to_none() {
        let table = WireTable::new();
        let bogus = WireValue {
            value_type: 99,
            ..Default::default()
        };
        assert_eq!(bogus.to_value(&table), None);

        let dangling = WireValue {
            value_type: ValueType::String as u8,
            payload: 4,
            ..Default::default()
        };
        assert_eq!(dangling.to_value(&table), None);
    }
}
