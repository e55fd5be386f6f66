//! The dynamically-typed value that flows through the wire codec.
//!
//! Signatures are planning structure only (see [`crate::signature`]); the
//! runtime data they describe is this tagged variant, whose arms mirror the
//! signature alphabet one-to-one.

use std::collections::HashMap;

/// A single dbus value. `Variant` is the only arm that carries its own
/// signature, since it is self-describing on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(u32),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Variant(Box<(String, Value)>),
}

impl Value {
    /// A short, human-readable name of this value's arm, used in error
    /// messages when a value doesn't match the signature it's being
    /// marshalled against.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::Uint16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::Uint32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object_path",
            Value::Signature(_) => "signature",
            Value::UnixFd(_) => "unix_fd",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant(_) => "variant",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Unwrap one layer of `Variant`, returning the inner value.
    pub fn into_variant_inner(self) -> Option<Value> {
        match self {
            Value::Variant(inner) => Some(inner.1),
            _ => None,
        }
    }

    /// The signature that describes this value's shape, used when wrapping
    /// a bare value in a `Variant` (e.g. for `Properties.Set`) without
    /// making the caller spell out the signature by hand. Arrays/dicts
    /// infer their element signature from the first entry; an empty one
    /// has no single correct signature and falls back to `s` on the
    /// (arbitrary, but harmless) assumption of an empty string array.
    pub fn infer_signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".into(),
            Value::Bool(_) => "b".into(),
            Value::Int16(_) => "n".into(),
            Value::Uint16(_) => "q".into(),
            Value::Int32(_) => "i".into(),
            Value::Uint32(_) => "u".into(),
            Value::Int64(_) => "x".into(),
            Value::Uint64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::Str(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::UnixFd(_) => "h".into(),
            Value::Variant(_) => "v".into(),
            Value::Array(items) => {
                let elem = items.first().map(Value::infer_signature).unwrap_or_else(|| "s".into());
                format!("a{elem}")
            }
            Value::Struct(fields) => {
                let inner: String = fields.iter().map(Value::infer_signature).collect();
                format!("({inner})")
            }
            Value::Dict(entries) => {
                let (key_sig, val_sig) = entries
                    .first()
                    .map(|(k, v)| (k.infer_signature(), v.infer_signature()))
                    .unwrap_or_else(|| ("s".into(), "s".into()));
                format!("a{{{key_sig}{val_sig}}}")
            }
        }
    }
}

macro_rules! impl_from {
    ($rust_ty:ty, $arm:ident) => {
        impl From<$rust_ty> for Value {
            fn from(v: $rust_ty) -> Value {
                Value::$arm(v)
            }
        }
    };
}

impl_from!(u8, Byte);
impl_from!(bool, Bool);
impl_from!(i16, Int16);
impl_from!(u16, Uint16);
impl_from!(i32, Int32);
impl_from!(u32, Uint32);
impl_from!(i64, Int64);
impl_from!(u64, Uint64);
impl_from!(f64, Double);

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Value {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<Value>, V: Into<Value>> From<HashMap<K, V>> for Value {
    fn from(v: HashMap<K, V>) -> Value {
        Value::Dict(v.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl TryFrom<Value> for String {
    type Error = Value;

    fn try_from(v: Value) -> Result<String, Value> {
        match v {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Ok(s),
            other => Err(other),
        }
    }
}

impl TryFrom<Value> for u32 {
    type Error = Value;

    fn try_from(v: Value) -> Result<u32, Value> {
        match v {
            Value::Uint32(n) => Ok(n),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_roundtrip() {
        let v: Value = "hello".into();
        assert_eq!(v.as_str(), Some("hello"));

        let v: Value = 7u32.into();
        assert_eq!(v.as_u32(), Some(7));

        let v: Value = vec!["a", "b"].into();
        assert_eq!(v.as_array().unwrap().len(), 2);
    }

    #[test]
    fn variant_unwraps() {
        let v = Value::Variant(Box::new(("u".to_owned(), Value::Uint32(42))));
        assert_eq!(v.into_variant_inner(), Some(Value::Uint32(42)));
    }
}
