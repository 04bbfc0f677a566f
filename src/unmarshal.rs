//! Streaming unmarshalling of wire format messages.

use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageKind};
use crate::proto::{
    Endianness, Flags, HeaderField, MessageType, FIXED_HEADER_LENGTH, MAX_ARRAY_LENGTH,
    MAX_MESSAGE_LENGTH, PROTOCOL_VERSION,
};
use crate::signature::{SignatureTree, SignatureType};
use crate::value::{Value, Variant};

/// The outcome of a single [`Unmarshaller::try_advance`] step.
#[derive(Debug)]
pub enum Progress {
    /// A complete message was decoded.
    Done(Message),
    /// At least this many more bytes are needed to make progress.
    NeedMore(usize),
    /// The stream was closed on a frame boundary.
    Eof,
}

#[derive(Debug, Clone, Copy)]
struct Fixed {
    endianness: Endianness,
    message_type: MessageType,
    flags: Flags,
    body_length: usize,
    serial: u32,
    fields_length: usize,
    /// Total length of the frame, body included.
    total: usize,
}

/// A resumable decoder for a stream of messages.
///
/// Bytes and file descriptors received from the transport are appended with
/// [`feed`] and [`feed_fds`], and [`try_advance`] is called until it reports
/// [`Progress::NeedMore`]. Partial frames are retained across calls.
///
/// [`feed`]: Unmarshaller::feed
/// [`feed_fds`]: Unmarshaller::feed_fds
/// [`try_advance`]: Unmarshaller::try_advance
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::{Message, Progress, Unmarshaller};
///
/// let m = Message::method_call("/org/freedesktop/DBus", "Hello")?.with_serial(1);
/// let bytes = m.marshal()?;
///
/// let mut unmarshaller = Unmarshaller::new();
/// unmarshaller.feed(&bytes);
///
/// let Progress::Done(decoded) = unmarshaller.try_advance()? else {
///     panic!("expected a complete message");
/// };
///
/// assert_eq!(decoded, m);
/// # Ok::<_, tokio_dbus_next::Error>(())
/// ```
#[derive(Default)]
pub struct Unmarshaller {
    buf: Vec<u8>,
    fds: Vec<OwnedFd>,
    fixed: Option<Fixed>,
    eof: bool,
}

impl Unmarshaller {
    /// Construct a new empty unmarshaller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append file descriptors received out-of-band from the transport.
    ///
    /// They are attached to the next message which completes.
    pub fn feed_fds(&mut self, fds: impl IntoIterator<Item = OwnedFd>) {
        self.fds.extend(fds);
    }

    /// Mark that the transport has reached end of file.
    pub fn feed_eof(&mut self) {
        self.eof = true;
    }

    /// Attempt to decode the next message.
    ///
    /// Returns [`Progress::Eof`] when the transport was closed between
    /// frames. A transport closed in the middle of a frame is an error.
    pub fn try_advance(&mut self) -> Result<Progress> {
        let fixed = match self.fixed {
            Some(fixed) => fixed,
            None => {
                if self.buf.len() < FIXED_HEADER_LENGTH {
                    if self.eof {
                        if self.buf.is_empty() {
                            return Ok(Progress::Eof);
                        }

                        return Err(Error::new(ErrorKind::Io(std::io::Error::from(
                            std::io::ErrorKind::UnexpectedEof,
                        ))));
                    }

                    return Ok(Progress::NeedMore(FIXED_HEADER_LENGTH - self.buf.len()));
                }

                let fixed = self.read_fixed()?;
                self.fixed = Some(fixed);
                fixed
            }
        };

        if self.buf.len() < fixed.total {
            if self.eof {
                return Err(Error::new(ErrorKind::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                ))));
            }

            return Ok(Progress::NeedMore(fixed.total - self.buf.len()));
        }

        let message = self.read_message(&fixed)?;
        self.buf.drain(..fixed.total);
        self.fixed = None;
        Ok(Progress::Done(message))
    }

    fn read_fixed(&self) -> Result<Fixed> {
        let endianness = match self.buf[0] {
            b'l' => Endianness::LITTLE,
            b'B' => Endianness::BIG,
            b => {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    format!("expected an endianness marker as the first byte, got {b}").into(),
                )));
            }
        };

        let message_type = match self.buf[1] {
            1 => MessageType::METHOD_CALL,
            2 => MessageType::METHOD_RETURN,
            3 => MessageType::ERROR,
            4 => MessageType::SIGNAL,
            b => {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    format!("got unknown message type {b}").into(),
                )));
            }
        };

        let flags = Flags(self.buf[2]);

        if self.buf[3] != PROTOCOL_VERSION {
            return Err(Error::new(ErrorKind::InvalidMessage(
                format!("got unknown protocol version {}", self.buf[3]).into(),
            )));
        }

        let read_u32 = |at: usize| -> u32 {
            let bytes = [
                self.buf[at],
                self.buf[at + 1],
                self.buf[at + 2],
                self.buf[at + 3],
            ];

            match endianness {
                Endianness::BIG => u32::from_be_bytes(bytes),
                _ => u32::from_le_bytes(bytes),
            }
        };

        let body_length = read_u32(4);
        let serial = read_u32(8);
        let fields_length = read_u32(12);

        if body_length > MAX_MESSAGE_LENGTH {
            return Err(Error::new(ErrorKind::BodyTooLong(body_length)));
        }

        if fields_length > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::ArrayTooLong(fields_length)));
        }

        let body_length = body_length as usize;
        let fields_length = fields_length as usize;
        let padding = fields_length.wrapping_neg() & 7;

        Ok(Fixed {
            endianness,
            message_type,
            flags,
            body_length,
            serial,
            fields_length,
            total: FIXED_HEADER_LENGTH + fields_length + padding + body_length,
        })
    }

    fn read_message(&mut self, fixed: &Fixed) -> Result<Message> {
        if fixed.serial == 0 {
            return Err(Error::new(ErrorKind::ZeroSerial));
        }

        let mut cursor = Cursor {
            buf: &self.buf[..fixed.total],
            at: FIXED_HEADER_LENGTH,
            endianness: fixed.endianness,
        };

        let mut path = None;
        let mut interface = None;
        let mut member = None;
        let mut error_name = None;
        let mut reply_serial = None;
        let mut destination = None;
        let mut sender = None;
        let mut signature = SignatureTree::empty();

        let fields_end = FIXED_HEADER_LENGTH + fixed.fields_length;

        while cursor.at < fields_end {
            // Header fields are `(yv)` structs, aligned to 8 bytes.
            cursor.align(8)?;

            let code = HeaderField(cursor.read_u8()?);
            let value = cursor.read_variant_value()?;

            match (code, value) {
                (HeaderField::PATH, Value::ObjectPath(value)) => path = Some(value),
                (HeaderField::INTERFACE, Value::String(value)) => interface = Some(value),
                (HeaderField::MEMBER, Value::String(value)) => member = Some(value),
                (HeaderField::ERROR_NAME, Value::String(value)) => error_name = Some(value),
                (HeaderField::REPLY_SERIAL, Value::Uint32(value)) => {
                    let Some(value) = NonZeroU32::new(value) else {
                        return Err(Error::new(ErrorKind::ZeroReplySerial));
                    };

                    reply_serial = Some(value);
                }
                (HeaderField::DESTINATION, Value::String(value)) => destination = Some(value),
                (HeaderField::SENDER, Value::String(value)) => sender = Some(value),
                (HeaderField::SIGNATURE, Value::Signature(value)) => {
                    signature = SignatureTree::new(&value)?;
                }
                // The descriptor count is implied by the out-of-band list.
                (HeaderField::UNIX_FDS, Value::Uint32(..)) => {}
                // Unknown header fields are skipped.
                (..) => {}
            }
        }

        cursor.align(8)?;

        let body_end = cursor.at + fixed.body_length;
        let mut body = Vec::new();

        if fixed.body_length > 0 {
            for ty in signature.types() {
                body.push(cursor.read_value(ty)?);
            }
        }

        if cursor.at != body_end {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "body does not match the declared body length".into(),
            )));
        }

        let kind = match fixed.message_type {
            MessageType::METHOD_CALL => {
                let Some(path) = path else {
                    return Err(Error::new(ErrorKind::MissingPath));
                };

                let Some(member) = member else {
                    return Err(Error::new(ErrorKind::MissingMember));
                };

                MessageKind::MethodCall { path, member }
            }
            MessageType::METHOD_RETURN => {
                let Some(reply_serial) = reply_serial else {
                    return Err(Error::new(ErrorKind::MissingReplySerial));
                };

                interface = None;
                MessageKind::MethodReturn { reply_serial }
            }
            MessageType::ERROR => {
                let Some(error_name) = error_name else {
                    return Err(Error::new(ErrorKind::MissingErrorName));
                };

                let Some(reply_serial) = reply_serial else {
                    return Err(Error::new(ErrorKind::MissingReplySerial));
                };

                interface = None;
                MessageKind::Error {
                    error_name,
                    reply_serial,
                }
            }
            MessageType::SIGNAL => {
                let Some(path) = path else {
                    return Err(Error::new(ErrorKind::MissingPath));
                };

                let Some(interface) = interface.take() else {
                    return Err(Error::new(ErrorKind::MissingInterface));
                };

                let Some(member) = member else {
                    return Err(Error::new(ErrorKind::MissingMember));
                };

                MessageKind::Signal {
                    path,
                    interface,
                    member,
                }
            }
            _ => return Err(Error::new(ErrorKind::InvalidProtocol)),
        };

        Ok(Message {
            kind,
            serial: fixed.serial,
            flags: fixed.flags,
            interface,
            destination,
            sender,
            signature,
            body,
            unix_fds: std::mem::take(&mut self.fds),
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
    endianness: Endianness,
}

macro_rules! read_int {
    ($name:ident, $ty:ty, $n:expr) => {
        fn $name(&mut self) -> Result<$ty> {
            self.align($n)?;
            let mut bytes = [0; $n];
            bytes.copy_from_slice(self.read_bytes($n)?);

            Ok(match self.endianness {
                Endianness::BIG => <$ty>::from_be_bytes(bytes),
                _ => <$ty>::from_le_bytes(bytes),
            })
        }
    };
}

impl<'a> Cursor<'a> {
    fn truncated() -> Error {
        Error::new(ErrorKind::InvalidMessage(
            "unexpected end of frame".into(),
        ))
    }

    fn align(&mut self, alignment: usize) -> Result<()> {
        let at = self.at + (self.at.wrapping_neg() & (alignment - 1));

        if at > self.buf.len() {
            return Err(Self::truncated());
        }

        self.at = at;
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let Some(end) = self.at.checked_add(n) else {
            return Err(Self::truncated());
        };

        let Some(bytes) = self.buf.get(self.at..end) else {
            return Err(Self::truncated());
        };

        self.at = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let [b] = self.read_bytes(1)? else {
            return Err(Self::truncated());
        };

        Ok(*b)
    }

    read_int!(read_u16, u16, 2);
    read_int!(read_i16, i16, 2);
    read_int!(read_u32, u32, 4);
    read_int!(read_i32, i32, 4);
    read_int!(read_u64, u64, 8);
    read_int!(read_i64, i64, 8);
    read_int!(read_f64, f64, 8);

    fn read_string(&mut self) -> Result<String> {
        let length = self.read_u32()? as usize;
        let bytes = self.read_bytes(length)?;
        let string = std::str::from_utf8(bytes)?.to_owned();

        if self.read_u8()? != 0 {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }

        Ok(string)
    }

    fn read_signature(&mut self) -> Result<String> {
        let length = self.read_u8()? as usize;
        let bytes = self.read_bytes(length)?;
        let string = std::str::from_utf8(bytes)?.to_owned();

        if self.read_u8()? != 0 {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }

        Ok(string)
    }

    /// Read a variant: a signature followed by the single value it describes.
    fn read_variant_value(&mut self) -> Result<Value> {
        let signature = self.read_signature()?;
        let tree = SignatureTree::new(&signature)?;

        let [ty] = tree.types() else {
            return Err(Error::new(ErrorKind::InvalidMessage(
                format!("variant must contain a single complete type, got `{signature}`").into(),
            )));
        };

        self.read_value(ty)
    }

    fn read_value(&mut self, ty: &SignatureType) -> Result<Value> {
        self.align(ty.alignment())?;

        match ty.token() {
            'y' => Ok(Value::Byte(self.read_u8()?)),
            'b' => match self.read_u32()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                value => Err(Error::new(ErrorKind::InvalidBoolean(value))),
            },
            'n' => Ok(Value::Int16(self.read_i16()?)),
            'q' => Ok(Value::Uint16(self.read_u16()?)),
            'i' => Ok(Value::Int32(self.read_i32()?)),
            'u' => Ok(Value::Uint32(self.read_u32()?)),
            'x' => Ok(Value::Int64(self.read_i64()?)),
            't' => Ok(Value::Uint64(self.read_u64()?)),
            'd' => Ok(Value::Double(self.read_f64()?)),
            'h' => Ok(Value::UnixFd(self.read_u32()?)),
            's' => Ok(Value::String(self.read_string()?)),
            'o' => Ok(Value::ObjectPath(self.read_string()?)),
            'g' => Ok(Value::Signature(self.read_signature()?)),
            'a' => self.read_array(ty),
            '(' => {
                let mut fields = Vec::with_capacity(ty.children().len());

                for child in ty.children() {
                    fields.push(self.read_value(child)?);
                }

                Ok(Value::Struct(fields))
            }
            'v' => {
                let signature = self.read_signature()?;
                let tree = SignatureTree::new(&signature)?;

                let [child] = tree.types() else {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        format!("variant must contain a single complete type, got `{signature}`")
                            .into(),
                    )));
                };

                let value = self.read_value(child)?;
                Ok(Value::Variant(Variant::from_type(child.clone(), value)))
            }
            token => Err(Error::new(ErrorKind::InvalidMessage(
                format!("cannot unmarshal type `{token}`").into(),
            ))),
        }
    }

    fn read_array(&mut self, ty: &SignatureType) -> Result<Value> {
        let length = self.read_u32()?;

        if length > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::ArrayTooLong(length)));
        }

        let length = length as usize;
        let child = &ty.children()[0];

        // The padding in front of an 8-aligned first element does not count
        // towards the array length.
        self.align(child.alignment())?;
        let start = self.at;

        let value = match child.token() {
            'y' => Value::ByteArray(self.read_bytes(length)?.to_vec()),
            '{' => {
                let mut entries = Vec::new();

                while self.at - start < length {
                    self.align(8)?;
                    let key = self.read_value(&child.children()[0])?;
                    let value = self.read_value(&child.children()[1])?;
                    entries.push((key, value));
                }

                Value::Dict(entries)
            }
            _ => {
                let mut values = Vec::new();

                while self.at - start < length {
                    values.push(self.read_value(child)?);
                }

                Value::Array(values)
            }
        };

        if self.at - start != length {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "array contents do not match the declared length".into(),
            )));
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests;
