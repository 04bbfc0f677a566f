use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::message::Message;
use crate::validators;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// Test if the error was raised because the connection is disconnected.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        matches!(self.kind, ErrorKind::Disconnected)
    }

    /// Access the structured remote error, if this error carries one.
    ///
    /// This is the error to inspect when a call performed through a proxy
    /// interface fails with an `ERROR` reply from the remote peer.
    #[inline]
    pub fn as_dbus_error(&self) -> Option<&DBusError> {
        match &self.kind {
            ErrorKind::DBus(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => Self::new(ErrorKind::WouldBlock),
            _ => Self::new(ErrorKind::Io(error)),
        }
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<DBusError> for Error {
    #[inline]
    fn from(error: DBusError) -> Self {
        Self::new(ErrorKind::DBus(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Utf8Error(error) => error.fmt(f),
            ErrorKind::DBus(error) => error.fmt(f),
            ErrorKind::WouldBlock => write!(f, "Would block"),
            ErrorKind::Disconnected => write!(f, "Connection is disconnected"),
            ErrorKind::MissingBus => write!(f, "Missing session bus"),
            ErrorKind::InvalidAddress(message) => {
                write!(f, "Invalid d-bus address: {message}")
            }
            ErrorKind::InvalidSignature(message) => {
                write!(f, "Invalid d-bus signature: {message}")
            }
            ErrorKind::InvalidMessage(message) => {
                write!(f, "Invalid message: {message}")
            }
            ErrorKind::InvalidBusName(name) => write!(f, "Invalid bus name `{name}`"),
            ErrorKind::InvalidObjectPath(path) => write!(f, "Invalid object path `{path}`"),
            ErrorKind::InvalidInterfaceName(name) => {
                write!(f, "Invalid interface name `{name}`")
            }
            ErrorKind::InvalidMemberName(name) => write!(f, "Invalid member name `{name}`"),
            ErrorKind::InvalidIntrospection(message) => {
                write!(f, "Invalid introspection data: {message}")
            }
            ErrorKind::SignatureBodyMismatch(message) => {
                write!(f, "Body does not match signature: {message}")
            }
            ErrorKind::Auth(message) => write!(f, "Authentication failed: {message}"),
            ErrorKind::InterfaceNotFound(name) => {
                write!(f, "Interface `{name}` not found on this object")
            }
            ErrorKind::UnknownMember(name) => write!(f, "Unknown member `{name}`"),
            ErrorKind::AlreadyExported(message) => write!(f, "{message}"),
            ErrorKind::SignalDisabled => write!(f, "Tried to emit a disabled signal"),
            ErrorKind::InvalidState(state) => write!(f, "Invalid connection state `{state}`"),
            ErrorKind::InvalidProtocol => write!(f, "Invalid protocol"),
            ErrorKind::InvalidBoolean(value) => {
                write!(f, "Invalid boolean value {value} (must be 0 or 1)")
            }
            ErrorKind::NotNullTerminated => write!(f, "String is not null terminated"),
            ErrorKind::MissingPath => write!(f, "Missing required PATH header"),
            ErrorKind::MissingInterface => write!(f, "Missing required INTERFACE header"),
            ErrorKind::MissingMember => write!(f, "Missing required MEMBER header"),
            ErrorKind::MissingReplySerial => write!(f, "Missing required REPLY_SERIAL header"),
            ErrorKind::MissingErrorName => write!(f, "Missing required ERROR_NAME header"),
            ErrorKind::ZeroSerial => write!(f, "Zero in header serial"),
            ErrorKind::ZeroReplySerial => write!(f, "Zero REPLY_SERIAL header"),
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::BodyTooLong(length) => {
                write!(f, "Body of length {length} is too long (max is 134217728)")
            }
            ErrorKind::MessageTooLong => {
                write!(f, "Message is too long")
            }
            ErrorKind::UnixFdsNotNegotiated => {
                write!(f, "File descriptor passing has not been negotiated")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            ErrorKind::DBus(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Utf8Error(Utf8Error),
    DBus(DBusError),
    WouldBlock,
    Disconnected,
    MissingBus,
    InvalidAddress(Box<str>),
    InvalidSignature(Box<str>),
    InvalidMessage(Box<str>),
    InvalidBusName(Box<str>),
    InvalidObjectPath(Box<str>),
    InvalidInterfaceName(Box<str>),
    InvalidMemberName(Box<str>),
    InvalidIntrospection(Box<str>),
    SignatureBodyMismatch(Box<str>),
    Auth(Box<str>),
    InterfaceNotFound(Box<str>),
    UnknownMember(Box<str>),
    AlreadyExported(Box<str>),
    SignalDisabled,
    InvalidState(&'static str),
    InvalidProtocol,
    InvalidBoolean(u32),
    NotNullTerminated,
    MissingPath,
    MissingInterface,
    MissingMember,
    MissingReplySerial,
    MissingErrorName,
    ZeroSerial,
    ZeroReplySerial,
    ArrayTooLong(u32),
    BodyTooLong(u32),
    MessageTooLong,
    UnixFdsNotNegotiated,
}

/// A structured error from or for a remote peer.
///
/// It carries the error name which goes into the `ERROR_NAME` header of an
/// `ERROR` message, a human readable text, and optionally the message it was
/// converted from.
#[derive(Debug)]
pub struct DBusError {
    name: String,
    text: String,
    reply: Option<Box<Message>>,
}

impl DBusError {
    /// A method call was sent to a member that does not exist.
    pub const UNKNOWN_METHOD: &'static str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// A message was sent to a path with no exported interfaces.
    pub const UNKNOWN_OBJECT: &'static str = "org.freedesktop.DBus.Error.UnknownObject";
    /// A property operation named an interface which is not exported.
    pub const UNKNOWN_INTERFACE: &'static str = "org.freedesktop.DBus.Error.UnknownInterface";
    /// A property operation named a property which does not exist.
    pub const UNKNOWN_PROPERTY: &'static str = "org.freedesktop.DBus.Error.UnknownProperty";
    /// A property was written which only supports read access.
    pub const PROPERTY_READ_ONLY: &'static str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    /// A property was written with a value of the wrong type.
    pub const INVALID_SIGNATURE: &'static str = "org.freedesktop.DBus.Error.InvalidSignature";
    /// The requested operation is not supported.
    pub const NOT_SUPPORTED: &'static str = "org.freedesktop.DBus.Error.NotSupported";
    /// Generic failure.
    pub const FAILED: &'static str = "org.freedesktop.DBus.Error.Failed";
    /// The connection was disconnected before a reply arrived.
    pub const DISCONNECTED: &'static str = "org.freedesktop.DBus.Error.Disconnected";
    /// Authentication with the message bus failed.
    pub const AUTH_FAILED: &'static str = "org.freedesktop.DBus.Error.AuthFailed";
    /// The named service is not known to the message bus.
    pub const SERVICE_UNKNOWN: &'static str = "org.freedesktop.DBus.Error.ServiceUnknown";
    /// The named bus name has no owner.
    pub const NAME_HAS_NO_OWNER: &'static str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    /// Arguments to a method call were invalid.
    pub const INVALID_ARGS: &'static str = "org.freedesktop.DBus.Error.InvalidArgs";

    /// A service interface handler failed with a non-D-Bus error.
    pub const SERVICE_ERROR: &'static str = "se.tedro.DBusNext.ServiceError";
    /// A user message handler failed with a non-D-Bus error.
    pub const INTERNAL_ERROR: &'static str = "se.tedro.DBusNext.InternalError";
    /// The remote peer replied with something the client did not expect.
    pub const CLIENT_ERROR: &'static str = "se.tedro.DBusNext.ClientError";

    /// Construct a new error with the given name and human readable text.
    ///
    /// The name must be a valid interface name, such as
    /// [`DBusError::UNKNOWN_METHOD`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio_dbus_next::DBusError;
    ///
    /// let error = DBusError::new("se.tedro.Error.Denied", "not allowed")?;
    /// assert_eq!(error.name(), "se.tedro.Error.Denied");
    /// # Ok::<_, tokio_dbus_next::Error>(())
    /// ```
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validators::assert_interface_name_valid(&name)?;

        Ok(Self {
            name,
            text: text.into(),
            reply: None,
        })
    }

    /// Convert an `ERROR` message into a structured error.
    ///
    /// The first body argument is used as the error text when it is a string.
    pub fn from_message(message: Message) -> Result<Self> {
        let Some(error_name) = message.error_name() else {
            return Err(Error::new(ErrorKind::MissingErrorName));
        };

        let name = error_name.to_owned();

        let text = match message.body().first() {
            Some(crate::Value::String(text)) => text.clone(),
            _ => String::new(),
        };

        Ok(Self {
            name,
            text,
            reply: Some(Box::new(message)),
        })
    }

    /// The name of the error, such as `org.freedesktop.DBus.Error.Failed`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human readable text of the error.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The `ERROR` message this error was converted from, if any.
    pub fn reply(&self) -> Option<&Message> {
        self.reply.as_deref()
    }

    /// Convert this error into an `ERROR` message replying to `message`.
    pub fn as_reply(&self, message: &Message) -> Result<Message> {
        Message::new_error(message, &self.name, &self.text)
    }
}

impl fmt::Display for DBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.text)
    }
}

impl error::Error for DBusError {}
