//! The dynamic value model: §3's tagged union of D-Bus value kinds.
//!
//! Design Notes point 1 replaces the source's runtime reflection over host
//! types with a compile-time [`ToValue`] trait (the "encodable" half of the
//! visitor pattern) plus this tagged [`Value`] enum for polymorphic decode.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{Error, ErrorKind, Result};
use crate::object_path::ObjectPath;
use crate::signature::Signature;

/// A self-describing value: a signature paired with the value it
/// describes.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub signature: Signature,
    pub value: Box<Value>,
}

impl Variant {
    pub fn new(value: Value) -> Self {
        Self {
            signature: value.signature(),
            value: Box::new(value),
        }
    }
}

/// A D-Bus value. Containers carry the signature of their element(s) so
/// that empty arrays and dicts still round-trip correctly.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Array {
        element_signature: Signature,
        items: Vec<Value>,
    },
    Struct(Vec<Value>),
    Dict {
        key_signature: Signature,
        value_signature: Signature,
        entries: Vec<(Value, Value)>,
    },
    Variant(Variant),
}

impl Value {
    /// The signature this value is encoded with. For a [`Value::Variant`]
    /// this is always `"v"` — the inner signature is carried separately
    /// and is not part of the enclosing signature, per spec §4.B.
    pub fn signature(&self) -> Signature {
        match self {
            Value::Byte(_) => Signature::new(Signature::BYTE).unwrap(),
            Value::Bool(_) => Signature::new(Signature::BOOLEAN).unwrap(),
            Value::I16(_) => Signature::new(Signature::INT16).unwrap(),
            Value::U16(_) => Signature::new(Signature::UINT16).unwrap(),
            Value::I32(_) => Signature::new(Signature::INT32).unwrap(),
            Value::U32(_) => Signature::new(Signature::UINT32).unwrap(),
            Value::I64(_) => Signature::new(Signature::INT64).unwrap(),
            Value::U64(_) => Signature::new(Signature::UINT64).unwrap(),
            Value::F64(_) => Signature::new(Signature::DOUBLE).unwrap(),
            Value::Str(_) => Signature::new(Signature::STRING).unwrap(),
            Value::ObjectPath(_) => Signature::new(Signature::OBJECT_PATH).unwrap(),
            Value::Signature(_) => Signature::new(Signature::SIGNATURE).unwrap(),
            Value::Array {
                element_signature, ..
            } => {
                let mut sig = Signature::new("a").unwrap();
                sig.push_signature(element_signature);
                sig
            }
            Value::Struct(items) => {
                let mut sig = Signature::new("(").unwrap();
                for item in items {
                    sig.push_signature(&item.signature());
                }
                let mut full = sig.as_str().to_owned();
                full.push(')');
                Signature::new(full).unwrap()
            }
            Value::Dict {
                key_signature,
                value_signature,
                ..
            } => {
                let mut s = String::from("a{");
                s.push_str(key_signature.as_str());
                s.push_str(value_signature.as_str());
                s.push('}');
                Signature::new(s).unwrap()
            }
            Value::Variant(_) => Signature::new(Signature::VARIANT).unwrap(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&ObjectPath> {
        match self {
            Value::ObjectPath(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }
}

/// Types that can be turned into a [`Value`] for encoding. The analogue of
/// `tokio-dbus`'s `Storable`/`Arguments` traits, generalized to target the
/// dynamic [`Value`] carrier instead of writing bytes directly.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

macro_rules! impl_to_value_numeric {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl ToValue for $ty {
                fn to_value(&self) -> Value {
                    Value::$variant(*self)
                }
            }
        )*
    };
}

impl_to_value_numeric! {
    u8 => Byte,
    bool => Bool,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
}

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::Str(self.to_owned())
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }
}

impl ToValue for ObjectPath {
    fn to_value(&self) -> Value {
        Value::ObjectPath(self.clone())
    }
}

impl ToValue for Signature {
    fn to_value(&self) -> Value {
        Value::Signature(self.clone())
    }
}

impl<T: ToValue> ToValue for &T {
    fn to_value(&self) -> Value {
        (**self).to_value()
    }
}

impl<T: ToValue> ToValue for [T] {
    fn to_value(&self) -> Value {
        let items: Vec<Value> = self.iter().map(ToValue::to_value).collect();
        let element_signature = items
            .first()
            .map(Value::signature)
            .unwrap_or_else(|| empty_slice_signature::<T>());
        Value::Array {
            element_signature,
            items,
        }
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        self.as_slice().to_value()
    }
}

/// Helper used only for empty slices, where we have no element to derive
/// a signature from. Defaults callers can't otherwise resolve to `"v"`
/// wrapped arrays are expected to supply an explicit [`Value::Array`]
/// instead of going through this impl.
fn empty_slice_signature<T>() -> Signature {
    Signature::new(Signature::VARIANT).unwrap()
}

impl ToValue for Variant {
    fn to_value(&self) -> Value {
        Value::Variant(self.clone())
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

macro_rules! impl_to_value_tuple {
    ($($name:ident),+) => {
        impl<$($name: ToValue),+> ToValue for ($($name,)+) {
            #[allow(non_snake_case)]
            fn to_value(&self) -> Value {
                let ($($name,)+) = self;
                Value::Struct(vec![$($name.to_value()),+])
            }
        }
    };
}

impl_to_value_tuple!(A);
impl_to_value_tuple!(A, B);
impl_to_value_tuple!(A, B, C);
impl_to_value_tuple!(A, B, C, D);
impl_to_value_tuple!(A, B, C, D, E);

/// Types that can be materialized back out of a decoded [`Value`]. The
/// analogue of `tokio-dbus`'s `Read` trait.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

macro_rules! impl_from_value_numeric {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(Error::new(ErrorKind::UnexpectedCode {
                            code: other.signature().as_bytes().first().copied().unwrap_or(b'?'),
                            target: stringify!($ty),
                        })),
                    }
                }
            }
        )*
    };
}

impl_from_value_numeric! {
    u8 => Byte,
    bool => Bool,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(Error::new(ErrorKind::UnexpectedCode {
                code: other.signature().as_bytes().first().copied().unwrap_or(b'?'),
                target: "String",
            })),
        }
    }
}

impl FromValue for ObjectPath {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::ObjectPath(p) => Ok(p),
            other => Err(Error::new(ErrorKind::UnexpectedCode {
                code: other.signature().as_bytes().first().copied().unwrap_or(b'?'),
                target: "ObjectPath",
            })),
        }
    }
}

impl FromValue for Signature {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Signature(s) => Ok(s),
            other => Err(Error::new(ErrorKind::UnexpectedCode {
                code: other.signature().as_bytes().first().copied().unwrap_or(b'?'),
                target: "Signature",
            })),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for Variant {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Variant(v) => Ok(v),
            other => Err(Error::new(ErrorKind::UnexpectedCode {
                code: other.signature().as_bytes().first().copied().unwrap_or(b'?'),
                target: "Variant",
            })),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array { items, .. } => items.into_iter().map(T::from_value).collect(),
            other => Err(Error::new(ErrorKind::UnexpectedCode {
                code: other.signature().as_bytes().first().copied().unwrap_or(b'?'),
                target: "Array",
            })),
        }
    }
}

impl<K, V> FromValue for HashMap<K, V>
where
    K: FromValue + Eq + Hash,
    V: FromValue,
{
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Dict { entries, .. } => entries
                .into_iter()
                .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            other => Err(Error::new(ErrorKind::UnexpectedCode {
                code: other.signature().as_bytes().first().copied().unwrap_or(b'?'),
                target: "Dict",
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_of_basic_values() {
        assert_eq!(Value::Byte(1).signature().as_str(), "y");
        assert_eq!(Value::Bool(true).signature().as_str(), "b");
        assert_eq!(Value::I64(1).signature().as_str(), "x");
    }

    #[test]
    fn signature_of_array() {
        let v = vec![1i32, 2, 3].to_value();
        assert_eq!(v.signature().as_str(), "ai");
    }

    #[test]
    fn signature_of_struct() {
        let v = (1u8, "hi".to_string()).to_value();
        assert_eq!(v.signature().as_str(), "(ys)");
    }

    #[test]
    fn variant_signature_is_v_not_inner() {
        let inner = Value::Str("hi".into());
        let v = Variant::new(inner);
        assert_eq!(v.signature.as_str(), "s");
        assert_eq!(Value::Variant(v).signature().as_str(), "v");
    }

    #[test]
    fn round_trip_u32() {
        let value = 42u32.to_value();
        assert_eq!(u32::from_value(value).unwrap(), 42);
    }
}
