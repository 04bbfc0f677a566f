//! Marshalling of dynamically typed values into wire format.

use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageKind};
use crate::proto::{Endianness, HeaderField, MAX_ARRAY_LENGTH, PROTOCOL_VERSION};
use crate::signature::{SignatureTree, SignatureType};
use crate::value::{Value, Variant};

/// An aligned buffer encoding values in a chosen endianness.
///
/// Alignment is relative to the start of the buffer. Body marshalling
/// therefore happens in a buffer of its own, which is sound because bodies
/// start at an 8-byte boundary in the final message.
pub(crate) struct Marshaller {
    buf: Vec<u8>,
    endianness: Endianness,
}

macro_rules! write_int {
    ($name:ident, $ty:ty, $align:expr) => {
        fn $name(&mut self, value: $ty) {
            self.align($align);

            match self.endianness {
                Endianness::BIG => self.buf.extend_from_slice(&value.to_be_bytes()),
                _ => self.buf.extend_from_slice(&value.to_le_bytes()),
            }
        }
    };
}

impl Marshaller {
    pub(crate) fn new(endianness: Endianness) -> Self {
        Self {
            buf: Vec::new(),
            endianness,
        }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Zero-pad the buffer up to the given alignment.
    pub(crate) fn align(&mut self, alignment: usize) {
        let padding = self.buf.len().wrapping_neg() & (alignment - 1);
        self.buf.resize(self.buf.len() + padding, 0);
    }

    write_int!(write_u16, u16, 2);
    write_int!(write_i16, i16, 2);
    write_int!(write_u32, u32, 4);
    write_int!(write_i32, i32, 4);
    write_int!(write_u64, u64, 8);
    write_int!(write_i64, i64, 8);
    write_int!(write_f64, f64, 8);

    fn write_string(&mut self, string: &str) {
        self.write_u32(string.len() as u32);
        self.buf.extend_from_slice(string.as_bytes());
        self.buf.push(0);
    }

    fn write_signature(&mut self, signature: &str) {
        self.buf.push(signature.len() as u8);
        self.buf.extend_from_slice(signature.as_bytes());
        self.buf.push(0);
    }

    /// Marshal a full body against its signature.
    ///
    /// The body is expected to have been verified against the signature
    /// already; values of the wrong shape fail here regardless.
    pub(crate) fn marshal_body(&mut self, signature: &SignatureTree, body: &[Value]) -> Result<()> {
        for (ty, value) in signature.types().iter().zip(body) {
            self.write_value(ty, value)?;
        }

        Ok(())
    }

    fn write_value(&mut self, ty: &SignatureType, value: &Value) -> Result<()> {
        self.align(ty.alignment());

        match (ty.token(), value) {
            ('y', Value::Byte(value)) => self.buf.push(*value),
            ('b', Value::Bool(value)) => self.write_u32(*value as u32),
            ('n', Value::Int16(value)) => self.write_i16(*value),
            ('q', Value::Uint16(value)) => self.write_u16(*value),
            ('i', Value::Int32(value)) => self.write_i32(*value),
            ('u', Value::Uint32(value)) => self.write_u32(*value),
            ('x', Value::Int64(value)) => self.write_i64(*value),
            ('t', Value::Uint64(value)) => self.write_u64(*value),
            ('d', Value::Double(value)) => self.write_f64(*value),
            ('h', Value::UnixFd(index)) => self.write_u32(*index),
            ('s', Value::String(value)) => self.write_string(value),
            ('o', Value::ObjectPath(value)) => self.write_string(value),
            ('g', Value::Signature(value)) => self.write_signature(value),
            ('a', value) => self.write_array(ty, value)?,
            ('(', Value::Struct(fields)) => {
                for (child, field) in ty.children().iter().zip(fields) {
                    self.write_value(child, field)?;
                }
            }
            ('v', Value::Variant(variant)) => self.write_variant(variant)?,
            _ => {
                return Err(Error::new(ErrorKind::SignatureBodyMismatch(
                    format!(
                        "cannot marshal {} as type `{}`",
                        value.type_name(),
                        ty.signature()
                    )
                    .into(),
                )));
            }
        }

        Ok(())
    }

    fn write_array(&mut self, ty: &SignatureType, value: &Value) -> Result<()> {
        let child = &ty.children()[0];

        // Placeholder for the length of the array contents. The first
        // element's padding does not count towards it.
        self.write_u32(0);
        let length_at = self.buf.len() - 4;

        self.align(child.alignment());
        let start = self.buf.len();

        match (child.token(), value) {
            ('y', Value::ByteArray(bytes)) => {
                self.buf.extend_from_slice(bytes);
            }
            ('{', Value::Dict(entries)) => {
                for (key, value) in entries {
                    self.align(8);
                    self.write_value(&child.children()[0], key)?;
                    self.write_value(&child.children()[1], value)?;
                }
            }
            (_, Value::Array(values)) => {
                for value in values {
                    self.write_value(child, value)?;
                }
            }
            _ => {
                return Err(Error::new(ErrorKind::SignatureBodyMismatch(
                    format!(
                        "cannot marshal {} as type `{}`",
                        value.type_name(),
                        ty.signature()
                    )
                    .into(),
                )));
            }
        }

        let Ok(length) = u32::try_from(self.buf.len() - start) else {
            return Err(Error::new(ErrorKind::ArrayTooLong(u32::MAX)));
        };

        if length > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::ArrayTooLong(length)));
        }

        let bytes = match self.endianness {
            Endianness::BIG => length.to_be_bytes(),
            _ => length.to_le_bytes(),
        };

        self.buf[length_at..length_at + 4].copy_from_slice(&bytes);
        Ok(())
    }

    fn write_variant(&mut self, variant: &Variant) -> Result<()> {
        self.write_signature(variant.signature());
        self.write_value(variant.ty(), variant.value())
    }

    /// Marshal the fixed header and header field array of a message.
    ///
    /// The header has the signature `yyyyuua(yv)` and is padded to an 8-byte
    /// boundary by the caller before the body follows.
    pub(crate) fn marshal_header(&mut self, message: &Message, body_length: u32) -> Result<()> {
        let mut fields = Vec::new();

        match &message.kind {
            MessageKind::MethodCall { path, member } => {
                fields.push(field(HeaderField::PATH, "o", Value::ObjectPath(path.clone()))?);
                fields.push(field(HeaderField::MEMBER, "s", Value::String(member.clone()))?);
            }
            MessageKind::MethodReturn { reply_serial } => {
                fields.push(field(
                    HeaderField::REPLY_SERIAL,
                    "u",
                    Value::Uint32(reply_serial.get()),
                )?);
            }
            MessageKind::Error {
                error_name,
                reply_serial,
            } => {
                fields.push(field(
                    HeaderField::ERROR_NAME,
                    "s",
                    Value::String(error_name.clone()),
                )?);
                fields.push(field(
                    HeaderField::REPLY_SERIAL,
                    "u",
                    Value::Uint32(reply_serial.get()),
                )?);
            }
            MessageKind::Signal {
                path,
                interface,
                member,
            } => {
                fields.push(field(HeaderField::PATH, "o", Value::ObjectPath(path.clone()))?);
                fields.push(field(
                    HeaderField::INTERFACE,
                    "s",
                    Value::String(interface.clone()),
                )?);
                fields.push(field(HeaderField::MEMBER, "s", Value::String(member.clone()))?);
            }
        }

        // Signals carry their interface in the kind already.
        if !matches!(message.kind, MessageKind::Signal { .. }) {
            if let Some(interface) = &message.interface {
                fields.push(field(
                    HeaderField::INTERFACE,
                    "s",
                    Value::String(interface.clone()),
                )?);
            }
        }

        if let Some(destination) = &message.destination {
            fields.push(field(
                HeaderField::DESTINATION,
                "s",
                Value::String(destination.clone()),
            )?);
        }

        if let Some(sender) = &message.sender {
            fields.push(field(
                HeaderField::SENDER,
                "s",
                Value::String(sender.clone()),
            )?);
        }

        if !message.signature.is_empty() {
            fields.push(field(
                HeaderField::SIGNATURE,
                "g",
                Value::Signature(message.signature.signature().to_owned()),
            )?);
        }

        if !message.unix_fds.is_empty() {
            fields.push(field(
                HeaderField::UNIX_FDS,
                "u",
                Value::Uint32(message.unix_fds.len() as u32),
            )?);
        }

        let header = vec![
            Value::Byte(self.endianness.0),
            Value::Byte(message.message_type().0),
            Value::Byte(message.flags.0),
            Value::Byte(PROTOCOL_VERSION),
            Value::Uint32(body_length),
            Value::Uint32(message.serial),
            Value::Array(fields),
        ];

        let signature = SignatureTree::new("yyyyuua(yv)")?;
        self.marshal_body(&signature, &header)
    }
}

fn field(code: HeaderField, signature: &str, value: Value) -> Result<Value> {
    Ok(Value::Struct(vec![
        Value::Byte(code.0),
        Value::Variant(Variant::new(signature, value)?),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marshal(signature: &str, body: Vec<Value>) -> Vec<u8> {
        let signature = SignatureTree::new(signature).unwrap();
        let mut m = Marshaller::new(Endianness::LITTLE);
        m.marshal_body(&signature, &body).unwrap();
        m.into_vec()
    }

    #[test]
    fn test_marshal_string() {
        let buf = marshal("s", vec![Value::from("hello")]);
        assert_eq!(buf, b"\x05\0\0\0hello\0");
    }

    #[test]
    fn test_marshal_signature() {
        let buf = marshal("g", vec![Value::Signature("a{sv}".into())]);
        assert_eq!(buf, b"\x05a{sv}\0");
    }

    #[test]
    fn test_marshal_alignment() {
        // The byte forces 7 bytes of padding before the u64.
        let buf = marshal("yt", vec![Value::Byte(1), Value::Uint64(2)]);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[8..], &2u64.to_le_bytes());
    }

    #[test]
    fn test_marshal_array_length_excludes_padding() {
        // The array length word is followed by 4 bytes of padding for the
        // 8-aligned element type, which must not count towards the length.
        let buf = marshal("at", vec![Value::Array(vec![Value::Uint64(1)])]);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..4], &8u32.to_le_bytes());
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_marshal_byte_array() {
        let buf = marshal("ay", vec![Value::ByteArray(vec![1, 2, 3])]);
        assert_eq!(buf, [3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_marshal_dict() {
        let buf = marshal(
            "a{yu}",
            vec![Value::Dict(vec![(Value::Byte(1), Value::Uint32(2))])],
        );

        assert_eq!(&buf[..4], &8u32.to_le_bytes());
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(buf[8], 1);
        assert_eq!(&buf[12..], &2u32.to_le_bytes());
    }

    #[test]
    fn test_marshal_big_endian() {
        let signature = SignatureTree::new("u").unwrap();
        let mut m = Marshaller::new(Endianness::BIG);
        m.marshal_body(&signature, &[Value::Uint32(1)]).unwrap();
        assert_eq!(m.into_vec(), [0, 0, 0, 1]);
    }

    #[test]
    fn test_marshal_variant() {
        let variant = Variant::new("u", Value::Uint32(5)).unwrap();
        let buf = marshal("v", vec![Value::Variant(variant)]);
        assert_eq!(&buf[..3], b"\x01u\0");
        // Value aligned to 4 after the 3-byte signature.
        assert_eq!(&buf[4..], &5u32.to_le_bytes());
    }

    #[test]
    fn test_marshal_mismatch() {
        let signature = SignatureTree::new("s").unwrap();
        let mut m = Marshaller::new(Endianness::LITTLE);
        assert!(m.marshal_body(&signature, &[Value::Uint32(1)]).is_err());
    }
}
