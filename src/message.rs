use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::error::{Error, ErrorKind, Result};
use crate::marshal::Marshaller;
use crate::proto::{Endianness, Flags, MessageType};
use crate::signature::SignatureTree;
use crate::validators;
use crate::value::Value;

/// The type of a [`Message`] along with the fields which are required for
/// that type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// A method call to an object exported by a peer.
    MethodCall {
        /// The path of the object being called.
        path: String,
        /// The method being called.
        member: String,
    },
    /// A reply to a method call.
    MethodReturn {
        /// The serial of the message this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// An error reply to a method call.
    Error {
        /// The name of the error which occurred.
        error_name: String,
        /// The serial of the message this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// A signal emission.
    Signal {
        /// The path of the object the signal is emitted from.
        path: String,
        /// The interface the signal belongs to.
        interface: String,
        /// The name of the signal.
        member: String,
    },
}

/// A single D-Bus frame.
///
/// Messages are constructed through [`Message::method_call`],
/// [`Message::new_signal`], [`Message::new_method_return`] and
/// [`Message::new_error`], all of which validate names and required fields
/// up front.
///
/// A message owns the file descriptors riding with it. Dropping the message
/// closes any descriptors which have not been taken out of it.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::{Message, MessageKind};
///
/// let m = Message::method_call("/org/freedesktop/DBus", "ListNames")?
///     .with_destination("org.freedesktop.DBus")?
///     .with_interface("org.freedesktop.DBus")?;
///
/// assert!(matches!(m.kind(), MessageKind::MethodCall { .. }));
/// assert_eq!(m.member(), Some("ListNames"));
/// # Ok::<_, tokio_dbus_next::Error>(())
/// ```
#[derive(Debug)]
pub struct Message {
    /// The type of the message.
    pub(crate) kind: MessageKind,
    /// Serial of the message. Zero means not yet stamped; the bus assigns a
    /// serial when the message is sent.
    pub(crate) serial: u32,
    /// Flags in the message.
    pub(crate) flags: Flags,
    /// The interface of a method call. For signals the interface is part of
    /// the kind since it is required there.
    pub(crate) interface: Option<String>,
    /// The destination of the message.
    pub(crate) destination: Option<String>,
    /// The sender of the message, stamped by the message bus.
    pub(crate) sender: Option<String>,
    /// The signature describing the body.
    pub(crate) signature: SignatureTree,
    /// The body values, conforming to the signature.
    pub(crate) body: Vec<Value>,
    /// File descriptors riding with the message. `h` typed body values index
    /// into this list.
    pub(crate) unix_fds: Vec<OwnedFd>,
}

impl Message {
    /// Construct a method call message.
    pub fn method_call(path: &str, member: &str) -> Result<Self> {
        validators::assert_object_path_valid(path)?;
        validators::assert_member_name_valid(member)?;

        Ok(Self::empty(MessageKind::MethodCall {
            path: path.to_owned(),
            member: member.to_owned(),
        }))
    }

    /// Construct a signal message.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio_dbus_next::{Message, Value};
    ///
    /// let m = Message::new_signal(
    ///     "/se/tedro/Example",
    ///     "se.tedro.Example",
    ///     "ValueChanged",
    ///     "u",
    ///     vec![Value::Uint32(42)],
    /// )?;
    ///
    /// assert_eq!(m.interface(), Some("se.tedro.Example"));
    /// # Ok::<_, tokio_dbus_next::Error>(())
    /// ```
    pub fn new_signal(
        path: &str,
        interface: &str,
        member: &str,
        signature: &str,
        body: Vec<Value>,
    ) -> Result<Self> {
        validators::assert_object_path_valid(path)?;
        validators::assert_interface_name_valid(interface)?;
        validators::assert_member_name_valid(member)?;

        Self::empty(MessageKind::Signal {
            path: path.to_owned(),
            interface: interface.to_owned(),
            member: member.to_owned(),
        })
        .with_body(signature, body)
    }

    /// Construct a method return replying to the given message.
    ///
    /// The destination is taken from the sender of the original message.
    pub fn new_method_return(
        reply_to: &Message,
        signature: &str,
        body: Vec<Value>,
    ) -> Result<Self> {
        let Some(reply_serial) = NonZeroU32::new(reply_to.serial) else {
            return Err(Error::new(ErrorKind::ZeroSerial));
        };

        let mut message =
            Self::empty(MessageKind::MethodReturn { reply_serial }).with_body(signature, body)?;

        message.destination = reply_to.sender.clone();
        Ok(message)
    }

    /// Construct an error replying to the given message.
    ///
    /// The error name must be a valid interface name and the human readable
    /// text is carried as the single `s` body argument.
    pub fn new_error(reply_to: &Message, error_name: &str, text: &str) -> Result<Self> {
        validators::assert_interface_name_valid(error_name)?;

        let Some(reply_serial) = NonZeroU32::new(reply_to.serial) else {
            return Err(Error::new(ErrorKind::ZeroSerial));
        };

        let mut message = Self::empty(MessageKind::Error {
            error_name: error_name.to_owned(),
            reply_serial,
        })
        .with_body("s", vec![Value::from(text)])?;

        message.destination = reply_to.sender.clone();
        Ok(message)
    }

    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            signature: SignatureTree::empty(),
            body: Vec::new(),
            unix_fds: Vec::new(),
        }
    }

    /// Get the kind of the message.
    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Get the wire type of the message.
    pub(crate) fn message_type(&self) -> MessageType {
        match self.kind {
            MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
            MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
            MessageKind::Error { .. } => MessageType::ERROR,
            MessageKind::Signal { .. } => MessageType::SIGNAL,
        }
    }

    /// Get the serial of the message, or zero if it has not been stamped yet.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Modify the serial of the message.
    #[must_use]
    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Get the flags of the message.
    #[must_use]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Modify the flags of the message.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio_dbus_next::{Flags, Message};
    ///
    /// let m = Message::method_call("/org/freedesktop/DBus", "Hello")?
    ///     .with_flags(Flags::NO_REPLY_EXPECTED);
    ///
    /// assert!(m.flags() & Flags::NO_REPLY_EXPECTED);
    /// # Ok::<_, tokio_dbus_next::Error>(())
    /// ```
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Get the path of the message, if the kind carries one.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { path, .. } => Some(path),
            MessageKind::Signal { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Get the member of the message, if the kind carries one.
    #[must_use]
    pub fn member(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { member, .. } => Some(member),
            MessageKind::Signal { member, .. } => Some(member),
            _ => None,
        }
    }

    /// Get the interface of the message.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Signal { interface, .. } => Some(interface),
            _ => self.interface.as_deref(),
        }
    }

    /// Modify the interface of the message.
    pub fn with_interface(mut self, interface: &str) -> Result<Self> {
        validators::assert_interface_name_valid(interface)?;
        self.interface = Some(interface.to_owned());
        Ok(self)
    }

    /// Get the error name of the message, for errors.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Error { error_name, .. } => Some(error_name),
            _ => None,
        }
    }

    /// Get the reply serial of the message, for replies and errors.
    #[must_use]
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        match self.kind {
            MessageKind::MethodReturn { reply_serial } => Some(reply_serial),
            MessageKind::Error { reply_serial, .. } => Some(reply_serial),
            _ => None,
        }
    }

    /// Get the destination of the message.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Modify the destination of the message.
    pub fn with_destination(mut self, destination: &str) -> Result<Self> {
        validators::assert_bus_name_valid(destination)?;
        self.destination = Some(destination.to_owned());
        Ok(self)
    }

    /// Get the sender of the message.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Modify the sender of the message.
    pub fn with_sender(mut self, sender: &str) -> Result<Self> {
        validators::assert_bus_name_valid(sender)?;
        self.sender = Some(sender.to_owned());
        Ok(self)
    }

    /// Get the signature of the message.
    #[must_use]
    pub fn signature(&self) -> &SignatureTree {
        &self.signature
    }

    /// Get the body of the message.
    #[must_use]
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Take the body out of the message.
    #[must_use]
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Modify the body and signature of the message.
    ///
    /// The body is verified against the signature.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio_dbus_next::{Message, Value};
    ///
    /// let m = Message::method_call("/org/freedesktop/DBus", "RequestName")?
    ///     .with_body("su", vec![Value::from("se.tedro.Example"), Value::Uint32(0)])?;
    ///
    /// assert_eq!(m.signature().signature(), "su");
    /// # Ok::<_, tokio_dbus_next::Error>(())
    /// ```
    pub fn with_body(mut self, signature: &str, body: Vec<Value>) -> Result<Self> {
        let signature = SignatureTree::new(signature)?;
        signature.verify_body(&body)?;
        self.signature = signature;
        self.body = body;
        Ok(self)
    }

    /// Get the file descriptors riding with this message.
    ///
    /// `h` typed body values are indexes into this list.
    #[must_use]
    pub fn unix_fds(&self) -> &[OwnedFd] {
        &self.unix_fds
    }

    /// Attach file descriptors to this message.
    #[must_use]
    pub fn with_unix_fds(mut self, unix_fds: Vec<OwnedFd>) -> Self {
        self.unix_fds = unix_fds;
        self
    }

    /// Take ownership of the file descriptors riding with this message.
    #[must_use]
    pub fn take_unix_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.unix_fds)
    }

    /// Marshal the message into its wire representation, in little endian.
    ///
    /// Errors if the message serial has not been stamped.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        self.marshal_with(Endianness::LITTLE)
    }

    pub(crate) fn marshal_with(&self, endianness: Endianness) -> Result<Vec<u8>> {
        if self.serial == 0 {
            return Err(Error::new(ErrorKind::ZeroSerial));
        }

        self.signature.verify_body(&self.body)?;

        let mut body = Marshaller::new(endianness);
        body.marshal_body(&self.signature, &self.body)?;
        let body = body.into_vec();

        let Ok(body_length) = u32::try_from(body.len()) else {
            return Err(Error::new(ErrorKind::MessageTooLong));
        };

        let mut header = Marshaller::new(endianness);
        header.marshal_header(self, body_length)?;
        header.align(8);

        let mut buf = header.into_vec();

        if buf.len() + body.len() > crate::proto::MAX_MESSAGE_LENGTH as usize {
            return Err(Error::new(ErrorKind::MessageTooLong));
        }

        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.serial == other.serial
            && self.flags == other.flags
            && self.interface == other.interface
            && self.destination == other.destination
            && self.sender == other.sender
            && self.signature == other.signature
            && self.body == other.body
            && self.unix_fds.len() == other.unix_fds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_fields() {
        assert!(Message::method_call("/org", "Hello").is_ok());
        assert!(Message::method_call("org", "Hello").is_err());
        assert!(Message::method_call("/org", "He.llo").is_err());

        assert!(Message::new_signal("/org", "org.example.Iface", "Changed", "", vec![]).is_ok());
        assert!(Message::new_signal("/org", "invalid", "Changed", "", vec![]).is_err());
    }

    #[test]
    fn test_reply_construction() {
        let call = Message::method_call("/org", "Hello").unwrap().with_serial(10);

        let ret = Message::new_method_return(&call, "s", vec![Value::from("ok")]).unwrap();
        assert_eq!(ret.reply_serial().map(|s| s.get()), Some(10));

        let err = Message::new_error(&call, "org.example.Error.Failed", "nope").unwrap();
        assert_eq!(err.error_name(), Some("org.example.Error.Failed"));
        assert_eq!(err.body(), [Value::from("nope")]);

        let unstamped = Message::method_call("/org", "Hello").unwrap();
        assert!(Message::new_method_return(&unstamped, "", vec![]).is_err());
    }

    #[test]
    fn test_reply_destination_from_sender() {
        let call = Message::method_call("/org", "Hello")
            .unwrap()
            .with_sender(":1.12")
            .unwrap()
            .with_serial(1);

        let ret = Message::new_method_return(&call, "", vec![]).unwrap();
        assert_eq!(ret.destination(), Some(":1.12"));
    }

    #[test]
    fn test_body_verification() {
        let m = Message::method_call("/org", "Hello").unwrap();
        assert!(m.with_body("s", vec![Value::Uint32(1)]).is_err());
    }

    #[test]
    fn test_marshal_requires_serial() {
        let m = Message::method_call("/org", "Hello").unwrap();
        assert!(m.marshal().is_err());
        assert!(m.with_serial(1).marshal().is_ok());
    }
}
