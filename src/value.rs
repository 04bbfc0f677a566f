//! Dynamically typed values carried in message bodies.

use std::fmt;

use crate::error::Result;
use crate::signature::SignatureType;

/// A single dynamically typed D-Bus value.
///
/// Which variant conforms to which signature token is determined by
/// [`SignatureType::verify`]. Arrays with a `y` element type are carried as
/// opaque [`Value::ByteArray`] buffers and dict entry arrays as ordered
/// [`Value::Dict`] pairs.
///
/// A `h` typed value holds the *index* of the file descriptor in the
/// accompanying out-of-band descriptor list of the message, not the
/// descriptor itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An 8-bit unsigned integer, type `y`.
    Byte(u8),
    /// A boolean, type `b`.
    Bool(bool),
    /// A 16-bit signed integer, type `n`.
    Int16(i16),
    /// A 16-bit unsigned integer, type `q`.
    Uint16(u16),
    /// A 32-bit signed integer, type `i`.
    Int32(i32),
    /// A 32-bit unsigned integer, type `u`.
    Uint32(u32),
    /// A 64-bit signed integer, type `x`.
    Int64(i64),
    /// A 64-bit unsigned integer, type `t`.
    Uint64(u64),
    /// An IEEE 754 double, type `d`.
    Double(f64),
    /// A string, type `s`.
    String(String),
    /// An object path, type `o`.
    ObjectPath(String),
    /// A signature string, type `g`.
    Signature(String),
    /// An index into the file descriptor list of a message, type `h`.
    UnixFd(u32),
    /// An ordered sequence, type `a` with a non-`y`, non-dict-entry element.
    Array(Vec<Value>),
    /// An opaque byte buffer, type `ay`.
    ByteArray(Vec<u8>),
    /// An ordered list of key-value pairs, type `a{..}`.
    Dict(Vec<(Value, Value)>),
    /// A fixed-length tuple, type `(..)`.
    Struct(Vec<Value>),
    /// A self-describing value, type `v`.
    Variant(Variant),
}

impl Value {
    /// A short name for the variant, used in diagnostics.
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Byte(..) => "a byte",
            Value::Bool(..) => "a boolean",
            Value::Int16(..) => "an int16",
            Value::Uint16(..) => "a uint16",
            Value::Int32(..) => "an int32",
            Value::Uint32(..) => "a uint32",
            Value::Int64(..) => "an int64",
            Value::Uint64(..) => "a uint64",
            Value::Double(..) => "a double",
            Value::String(..) => "a string",
            Value::ObjectPath(..) => "an object path",
            Value::Signature(..) => "a signature",
            Value::UnixFd(..) => "a unix fd index",
            Value::Array(..) => "an array",
            Value::ByteArray(..) => "a byte array",
            Value::Dict(..) => "a dict",
            Value::Struct(..) => "a struct",
            Value::Variant(..) => "a variant",
        }
    }

    /// Coerce into a string slice, if this is a string-like value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) | Value::ObjectPath(value) | Value::Signature(value) => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Coerce into a `u32`, if this is a `u` or `h` typed value.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::Uint32(value) | Value::UnixFd(value) => Some(value),
            _ => None,
        }
    }

    /// Coerce into a `bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(value) => Some(value),
            _ => None,
        }
    }

    /// Coerce into an array of values.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Coerce into dict entries.
    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Coerce into a variant.
    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(variant) => Some(variant),
            _ => None,
        }
    }
}

macro_rules! from_impl {
    ($($from:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$from> for Value {
                #[inline]
                fn from(value: $from) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    }
}

from_impl! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f64 => Double,
    String => String,
    Vec<u8> => ByteArray,
    Variant => Variant,
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

/// A value paired with the signature describing it.
///
/// The signature must be a single complete type and the value is verified
/// against it at construction.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::{Value, Variant};
///
/// let variant = Variant::new("as", Value::Array(vec![Value::from("hi")]))?;
/// assert_eq!(variant.signature(), "as");
///
/// assert!(Variant::new("as", Value::from(10u32)).is_err());
/// assert!(Variant::new("asas", Value::from("hi")).is_err());
/// # Ok::<_, tokio_dbus_next::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Variant {
    ty: SignatureType,
    value: Box<Value>,
}

impl Variant {
    /// Construct a new variant over a signature and a conforming value.
    pub fn new(signature: &str, value: Value) -> Result<Self> {
        let ty = SignatureType::new(signature)?;
        ty.verify(&value)?;

        Ok(Self {
            ty,
            value: Box::new(value),
        })
    }

    /// Construct a new variant from an already parsed type.
    pub(crate) fn from_type(ty: SignatureType, value: Value) -> Self {
        Self {
            ty,
            value: Box::new(value),
        }
    }

    /// The signature string of the contained value.
    pub fn signature(&self) -> &str {
        self.ty.signature()
    }

    /// The type of the contained value.
    pub fn ty(&self) -> &SignatureType {
        &self.ty
    }

    /// The contained value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Unwrap the contained value.
    pub fn into_value(self) -> Value {
        *self.value
    }
}

impl PartialEq for Variant {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ty.signature() == other.ty.signature() && self.value == other.value
    }
}

impl fmt::Display for Variant {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Variant({}, {:?})", self.ty.signature(), self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_construction() {
        let variant = Variant::new("u", Value::Uint32(10)).unwrap();
        assert_eq!(variant.signature(), "u");
        assert_eq!(*variant.value(), Value::Uint32(10));

        assert!(Variant::new("u", Value::Int32(10)).is_err());
        assert!(Variant::new("uu", Value::Uint32(10)).is_err());
        assert!(Variant::new("", Value::Uint32(10)).is_err());
    }

    #[test]
    fn test_variant_equality() {
        let a = Variant::new("s", Value::from("hello")).unwrap();
        let b = Variant::new("s", Value::from("hello")).unwrap();
        let c = Variant::new("s", Value::from("world")).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_nested_variant() {
        let inner = Variant::new("i", Value::Int32(-1)).unwrap();
        let outer = Variant::new("v", Value::Variant(inner)).unwrap();
        assert_eq!(outer.signature(), "v");
    }
}
