//! The message bus connection: lifecycle, routing, and the client API.

pub use self::match_rule::{MatchRule, SignalHandler, SubscriptionId};
mod match_rule;

mod standard;

use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot, watch};

use self::match_rule::Subscriptions;
use crate::address::{get_bus_address, parse_address, BusAddress, BusType};
use crate::auth;
use crate::auth::{AuthRequest, AuthResponse};
use crate::connection::{AuthClient, Transport};
use crate::error::{DBusError, Error, ErrorKind, Result};
use crate::introspection::Node;
use crate::message::{Message, MessageKind};
use crate::org_freedesktop_dbus::{self, NameFlag, NameReply, ReleaseNameReply};
use crate::proto::Flags;
use crate::proxy::ProxyObject;
use crate::service::ServiceInterface;
use crate::unmarshal::{Progress, Unmarshaller};
use crate::utils::lock;
use crate::validators;
use crate::value::Value;

/// A marshalled message and the descriptors riding with it.
type Frame = (Vec<u8>, Vec<OwnedFd>);

/// The result of offering a message to a user message handler.
pub enum HandlerResult {
    /// The handler did not handle the message, keep offering it.
    Pass,
    /// The handler handled the message.
    Handled,
    /// The handler handled the message and wants this reply sent.
    Reply(Message),
}

/// A user message handler. Handlers see every incoming message before any
/// other routing, in registration order.
pub type MessageHandler = Box<dyn FnMut(&Message) -> Result<HandlerResult> + Send>;

/// Identifies a registered message handler for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// The lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusPhase {
    /// Created, not yet connected.
    New,
    /// Socket setup in progress.
    Connecting,
    /// SASL handshake in progress.
    Authenticating,
    /// `Hello` sent, waiting for the unique name.
    HelloPending,
    /// Connected and processing messages.
    Ready,
    /// Terminal state, all further sends fail.
    Disconnected,
}

impl BusPhase {
    fn name(&self) -> &'static str {
        match self {
            BusPhase::New => "new",
            BusPhase::Connecting => "connecting",
            BusPhase::Authenticating => "authenticating",
            BusPhase::HelloPending => "hello-pending",
            BusPhase::Ready => "ready",
            BusPhase::Disconnected => "disconnected",
        }
    }
}

struct State {
    phase: BusPhase,
    unique_name: Option<String>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    /// Messages accepted before the connection became ready, flushed in
    /// order right after the `Hello` reply.
    buffered: Vec<Frame>,
}

enum Responder {
    Oneshot(oneshot::Sender<Result<Message>>),
    Callback(Box<dyn FnOnce(Result<Message>) + Send>),
}

impl Responder {
    fn complete(self, result: Result<Message>) {
        match self {
            // The caller may have cancelled and dropped the receiving end,
            // in which case the result is simply dropped.
            Responder::Oneshot(sender) => {
                let _ = sender.send(result);
            }
            Responder::Callback(callback) => callback(result),
        }
    }
}

struct PendingCall {
    /// The destination of the original call, used to seed the name owner
    /// cache from the reply sender.
    destination: Option<String>,
    responder: Responder,
}

pub(crate) struct BusInner {
    addresses: Vec<BusAddress>,
    state: Mutex<State>,
    serial: AtomicU32,
    replies: Mutex<HashMap<u32, PendingCall>>,
    handlers: Mutex<Vec<(u64, Arc<Mutex<MessageHandler>>)>>,
    next_handler_id: AtomicU64,
    exports: Mutex<BTreeMap<String, Vec<Arc<ServiceInterface>>>>,
    subscriptions: Mutex<Subscriptions>,
    name_owners: Mutex<HashMap<String, String>>,
    pub(crate) machine_id: Mutex<Option<String>>,
    unix_fds_negotiated: AtomicBool,
    /// A duplicate of the transport used to force a shutdown on disconnect.
    shutdown: Mutex<Option<Transport>>,
    disconnected: watch::Sender<bool>,
}

/// An asynchronous connection to a message bus.
///
/// The bus is created disconnected. [`connect`] performs socket setup, the
/// SASL handshake and the `Hello` exchange, after which messages flow.
/// Messages sent before the connection is ready are buffered and flushed in
/// order once it is.
///
/// `MessageBus` is a cheap handle: clones refer to the same connection.
///
/// [`connect`]: MessageBus::connect
///
/// # Examples
///
/// ```no_run
/// use tokio_dbus_next::{Message, MessageBus};
///
/// # #[tokio::main] async fn main() -> tokio_dbus_next::Result<()> {
/// let bus = MessageBus::session_bus()?;
/// let name = bus.connect().await?;
/// assert!(name.starts_with(':'));
///
/// let reply = bus
///     .call(
///         Message::method_call("/org/freedesktop/DBus", "ListNames")?
///             .with_destination("org.freedesktop.DBus")?
///             .with_interface("org.freedesktop.DBus")?,
///     )
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Construct a disconnected bus for the session bus address.
    ///
    /// The address is taken from the `DBUS_SESSION_BUS_ADDRESS` environment
    /// variable.
    pub fn session_bus() -> Result<Self> {
        Self::from_address(&get_bus_address(BusType::Session)?)
    }

    /// Construct a disconnected bus for the system bus address.
    ///
    /// The address is taken from the `DBUS_SYSTEM_BUS_ADDRESS` environment
    /// variable, with a fallback to the well-known system bus socket.
    pub fn system_bus() -> Result<Self> {
        Self::from_address(&get_bus_address(BusType::System)?)
    }

    /// Construct a disconnected bus for the given address string.
    pub fn from_address(address: &str) -> Result<Self> {
        let addresses = parse_address(address)?;

        Ok(Self {
            inner: Arc::new(BusInner {
                addresses,
                state: Mutex::new(State {
                    phase: BusPhase::New,
                    unique_name: None,
                    writer: None,
                    buffered: Vec::new(),
                }),
                serial: AtomicU32::new(1),
                replies: Mutex::new(HashMap::new()),
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(0),
                exports: Mutex::new(BTreeMap::new()),
                subscriptions: Mutex::new(Subscriptions::default()),
                name_owners: Mutex::new(HashMap::new()),
                machine_id: Mutex::new(None),
                unix_fds_negotiated: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                disconnected: watch::channel(false).0,
            }),
        })
    }

    /// Connect to the bus: socket setup, authentication and the `Hello`
    /// exchange. Returns the unique name assigned to this connection.
    pub async fn connect(&self) -> Result<String> {
        {
            let mut state = lock(&self.inner.state);

            match state.phase {
                BusPhase::New => state.phase = BusPhase::Connecting,
                phase => return Err(Error::new(ErrorKind::InvalidState(phase.name()))),
            }
        }

        match self.connect_inner().await {
            Ok(name) => Ok(name),
            Err(error) => {
                self.inner.finalize();
                Err(error)
            }
        }
    }

    async fn connect_inner(&self) -> Result<String> {
        let inner = &self.inner;

        let transport = Transport::connect(&inner.addresses)?;
        transport.set_nonblocking(true)?;

        let supports_fds = transport.supports_unix_fd();
        *lock(&inner.shutdown) = Some(transport.try_clone()?);

        lock(&inner.state).phase = BusPhase::Authenticating;

        let mut client = AuthClient::new(transport)?;
        client.send_nul().await?;

        let payload = auth::external_payload_for_self();
        client.send(&AuthRequest::External(&payload)).await?;

        match client.recv().await? {
            AuthResponse::Ok(..) => {}
            AuthResponse::Rejected(mechanisms) => {
                return Err(Error::new(ErrorKind::Auth(
                    format!("authentication rejected, server supports: {mechanisms}").into(),
                )));
            }
            response => {
                return Err(Error::new(ErrorKind::Auth(
                    format!("unexpected response during authentication: {response:?}").into(),
                )));
            }
        }

        if supports_fds {
            client.send(&AuthRequest::NegotiateUnixFd).await?;

            match client.recv().await? {
                AuthResponse::AgreeUnixFd => {
                    inner.unix_fds_negotiated.store(true, Ordering::Relaxed);
                }
                AuthResponse::Error(..) => {}
                response => {
                    return Err(Error::new(ErrorKind::Auth(
                        format!("unexpected response to NEGOTIATE_UNIX_FD: {response:?}").into(),
                    )));
                }
            }
        }

        client.send(&AuthRequest::Begin).await?;

        let write_transport = client.transport().try_clone()?;
        let (read_fd, leftover) = client.into_parts();
        let write_fd = AsyncFd::new(write_transport)?;

        let (writer, writer_rx) = mpsc::unbounded_channel();

        {
            let mut state = lock(&inner.state);
            state.phase = BusPhase::HelloPending;
            state.writer = Some(writer);
        }

        tokio::spawn(write_task(Arc::downgrade(inner), write_fd, writer_rx));

        let mut unmarshaller = Unmarshaller::new();
        unmarshaller.feed(&leftover);

        tokio::spawn(read_task(inner.clone(), read_fd, unmarshaller));

        // Hello must be answered before anything else is put on the wire,
        // so it bypasses the pre-ready buffer.
        let hello = Message::method_call(org_freedesktop_dbus::PATH, "Hello")?
            .with_destination(org_freedesktop_dbus::DESTINATION)?
            .with_interface(org_freedesktop_dbus::INTERFACE)?
            .with_serial(inner.next_serial());

        let (sender, receiver) = oneshot::channel();

        lock(&inner.replies).insert(
            hello.serial(),
            PendingCall {
                destination: hello.destination().map(str::to_owned),
                responder: Responder::Oneshot(sender),
            },
        );

        let rule = MatchRule::signal()
            .with_sender(org_freedesktop_dbus::DESTINATION)
            .with_interface(org_freedesktop_dbus::INTERFACE)
            .with_member("NameOwnerChanged")
            .with_path(org_freedesktop_dbus::PATH);

        let add_match = Message::method_call(org_freedesktop_dbus::PATH, "AddMatch")?
            .with_destination(org_freedesktop_dbus::DESTINATION)?
            .with_interface(org_freedesktop_dbus::INTERFACE)?
            .with_body("s", vec![Value::from(rule.to_string())])?
            .with_serial(inner.next_serial());

        let weak = Arc::downgrade(inner);

        lock(&inner.replies).insert(
            add_match.serial(),
            PendingCall {
                destination: add_match.destination().map(str::to_owned),
                responder: Responder::Callback(Box::new(move |result| {
                    let failed = match &result {
                        Ok(reply) => matches!(reply.kind(), MessageKind::Error { .. }),
                        Err(..) => true,
                    };

                    if failed {
                        tracing::error!("adding match for NameOwnerChanged failed");

                        if let Some(inner) = weak.upgrade() {
                            inner.finalize();
                        }
                    }
                })),
            },
        );

        inner.send_direct(hello)?;
        inner.send_direct(add_match)?;

        let reply = match receiver.await {
            Ok(reply) => reply?,
            Err(..) => return Err(Error::new(ErrorKind::Disconnected)),
        };

        let name = match reply.kind() {
            MessageKind::MethodReturn { .. } => match reply.body().first() {
                Some(Value::String(name)) => name.clone(),
                _ => {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "Hello reply did not carry a bus name".into(),
                    )));
                }
            },
            MessageKind::Error { .. } => return Err(DBusError::from_message(reply)?.into()),
            _ => {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    "unexpected reply to Hello".into(),
                )));
            }
        };

        {
            let mut state = lock(&inner.state);
            state.unique_name = Some(name.clone());

            // Flush everything buffered before ready, in order, before any
            // post-ready send can interleave.
            let buffered = std::mem::take(&mut state.buffered);

            if let Some(writer) = &state.writer {
                for frame in buffered {
                    let _ = writer.send(frame);
                }
            }

            state.phase = BusPhase::Ready;
        }

        Ok(name)
    }

    /// The unique name assigned to this connection, once connected.
    pub fn unique_name(&self) -> Option<String> {
        lock(&self.inner.state).unique_name.clone()
    }

    /// Allocate the next outgoing serial.
    pub fn next_serial(&self) -> u32 {
        self.inner.next_serial()
    }

    /// Queue a message for sending. Never blocks.
    ///
    /// A zero serial is stamped with the next free serial. Before the
    /// connection is ready the message is buffered, after a disconnect the
    /// send fails.
    pub fn send(&self, message: Message) -> Result<()> {
        self.inner.send_message(message)?;
        Ok(())
    }

    /// Send a method call and await its reply.
    ///
    /// For calls flagged [`Flags::NO_REPLY_EXPECTED`] no pending call is
    /// recorded and `None` is returned immediately. Otherwise the reply
    /// message is returned as-is, including `ERROR` replies.
    pub async fn call(&self, mut message: Message) -> Result<Option<Message>> {
        if message.flags() & Flags::NO_REPLY_EXPECTED {
            self.inner.send_message(message)?;
            return Ok(None);
        }

        if message.serial() == 0 {
            message = message.with_serial(self.inner.next_serial());
        }

        let serial = message.serial();
        let (sender, receiver) = oneshot::channel();

        lock(&self.inner.replies).insert(
            serial,
            PendingCall {
                destination: message.destination().map(str::to_owned),
                responder: Responder::Oneshot(sender),
            },
        );

        if let Err(error) = self.inner.send_message(message) {
            lock(&self.inner.replies).remove(&serial);
            return Err(error);
        }

        match receiver.await {
            Ok(reply) => reply.map(Some),
            Err(..) => Err(Error::new(ErrorKind::Disconnected)),
        }
    }

    /// Request a well-known name from the bus daemon.
    pub async fn request_name(&self, name: &str, flags: NameFlag) -> Result<NameReply> {
        validators::assert_bus_name_valid(name)?;

        let message = Message::method_call(org_freedesktop_dbus::PATH, "RequestName")?
            .with_destination(org_freedesktop_dbus::DESTINATION)?
            .with_interface(org_freedesktop_dbus::INTERFACE)?
            .with_body("su", vec![Value::from(name), Value::Uint32(flags.0)])?;

        let reply = self.call_expecting_reply(message).await?;
        let reply = check_method_return(reply, "u")?;

        match reply.body().first() {
            Some(Value::Uint32(code)) => Ok(NameReply(*code)),
            _ => Err(Error::new(ErrorKind::InvalidMessage(
                "RequestName reply did not carry a reply code".into(),
            ))),
        }
    }

    /// Release a well-known name at the bus daemon.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        validators::assert_bus_name_valid(name)?;

        let message = Message::method_call(org_freedesktop_dbus::PATH, "ReleaseName")?
            .with_destination(org_freedesktop_dbus::DESTINATION)?
            .with_interface(org_freedesktop_dbus::INTERFACE)?
            .with_body("s", vec![Value::from(name)])?;

        let reply = self.call_expecting_reply(message).await?;
        let reply = check_method_return(reply, "u")?;

        match reply.body().first() {
            Some(Value::Uint32(code)) => Ok(ReleaseNameReply(*code)),
            _ => Err(Error::new(ErrorKind::InvalidMessage(
                "ReleaseName reply did not carry a reply code".into(),
            ))),
        }
    }

    /// Introspect an object exported by a remote peer.
    pub async fn introspect(&self, bus_name: &str, path: &str) -> Result<Node> {
        validators::assert_bus_name_valid(bus_name)?;
        validators::assert_object_path_valid(path)?;

        let message = Message::method_call(path, "Introspect")?
            .with_destination(bus_name)?
            .with_interface(org_freedesktop_dbus::INTROSPECTABLE)?;

        let reply = self.call_expecting_reply(message).await?;
        let reply = check_method_return(reply, "s")?;

        match reply.body().first() {
            Some(Value::String(data)) => Node::parse(data),
            _ => Err(Error::new(ErrorKind::InvalidMessage(
                "Introspect reply did not carry a document".into(),
            ))),
        }
    }

    /// Get a proxy object for the `(bus_name, path)` pair from its
    /// introspection data.
    pub fn get_proxy_object(
        &self,
        bus_name: &str,
        path: &str,
        introspection: Node,
    ) -> Result<ProxyObject> {
        ProxyObject::new(self.clone(), bus_name, path, introspection)
    }

    /// Export a service interface at the given path.
    ///
    /// The same interface instance may be exported at several paths, but no
    /// two interfaces with the same name may share a path.
    pub fn export(&self, path: &str, interface: &Arc<ServiceInterface>) -> Result<()> {
        validators::assert_object_path_valid(path)?;

        {
            let mut exports = lock(&self.inner.exports);

            if let Some(interfaces) = exports.get(path) {
                if interfaces.iter().any(|i| i.name() == interface.name()) {
                    return Err(Error::new(ErrorKind::AlreadyExported(
                        format!(
                            "an interface named `{}` is already exported at `{path}`",
                            interface.name()
                        )
                        .into(),
                    )));
                }
            }

            exports
                .entry(path.to_owned())
                .or_default()
                .push(interface.clone());
        }

        interface.add_bus(Arc::downgrade(&self.inner));
        self.inner.emit_interfaces_added(path, interface);
        Ok(())
    }

    /// Remove every interface exported at the given path.
    pub fn unexport(&self, path: &str) -> Result<()> {
        validators::assert_object_path_valid(path)?;
        let removed = lock(&self.inner.exports).remove(path).unwrap_or_default();
        self.release_interfaces(path, removed);
        Ok(())
    }

    /// Remove a single interface exported at the given path.
    pub fn unexport_interface(&self, path: &str, interface: &Arc<ServiceInterface>) -> Result<()> {
        validators::assert_object_path_valid(path)?;

        let mut removed = Vec::new();

        {
            let mut exports = lock(&self.inner.exports);

            if let Some(interfaces) = exports.get_mut(path) {
                if let Some(at) = interfaces.iter().position(|i| Arc::ptr_eq(i, interface)) {
                    removed.push(interfaces.remove(at));
                }

                if interfaces.is_empty() {
                    exports.remove(path);
                }
            }
        }

        self.release_interfaces(path, removed);
        Ok(())
    }

    fn release_interfaces(&self, path: &str, removed: Vec<Arc<ServiceInterface>>) {
        if removed.is_empty() {
            return;
        }

        {
            // An aliased instance keeps its back-reference as long as it is
            // exported at any other path on this bus.
            let exports = lock(&self.inner.exports);

            for interface in &removed {
                let still_exported = exports
                    .values()
                    .any(|interfaces| interfaces.iter().any(|i| Arc::ptr_eq(i, interface)));

                if !still_exported {
                    interface.remove_bus(Arc::as_ptr(&self.inner));
                }
            }
        }

        self.inner.emit_interfaces_removed(path, &removed);
    }

    /// Register a message handler which sees every incoming message before
    /// any other routing.
    pub fn add_message_handler(
        &self,
        handler: impl FnMut(&Message) -> Result<HandlerResult> + Send + 'static,
    ) -> HandlerId {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);

        lock(&self.inner.handlers).push((id, Arc::new(Mutex::new(Box::new(handler)))));
        HandlerId(id)
    }

    /// Remove a previously registered message handler.
    pub fn remove_message_handler(&self, id: HandlerId) {
        lock(&self.inner.handlers).retain(|(handler_id, ..)| *handler_id != id.0);
    }

    /// Disconnect from the bus.
    ///
    /// All pending calls fail with a disconnection error, exported objects
    /// are unexported and further sends fail.
    pub fn disconnect(&self) {
        if let Some(transport) = lock(&self.inner.shutdown).take() {
            if let Err(error) = transport.shutdown() {
                tracing::debug!("shutting down the transport failed: {error}");
            }
        }

        self.inner.finalize();
    }

    /// Wait until the bus reaches the disconnected state, whether through
    /// [`disconnect`], transport EOF or a fatal error.
    ///
    /// [`disconnect`]: MessageBus::disconnect
    pub async fn wait_for_disconnect(&self) {
        let mut receiver = self.inner.disconnected.subscribe();

        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    async fn call_expecting_reply(&self, message: Message) -> Result<Message> {
        match self.call(message).await? {
            Some(reply) => Ok(reply),
            None => Err(Error::new(ErrorKind::Disconnected)),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<BusInner> {
        &self.inner
    }
}

/// Validate that a reply is a method return with the given signature,
/// converting `ERROR` replies into structured errors.
pub(crate) fn check_method_return(reply: Message, signature: &str) -> Result<Message> {
    match reply.kind() {
        MessageKind::MethodReturn { .. } if reply.signature().signature() == signature => Ok(reply),
        MessageKind::Error { .. } => Err(DBusError::from_message(reply)?.into()),
        _ => Err(DBusError::new(
            DBusError::INTERNAL_ERROR,
            "invalid message type for method call",
        )?
        .into()),
    }
}

impl BusInner {
    pub(crate) fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);

            if serial != 0 {
                return serial;
            }
        }
    }

    fn is_ready(&self) -> bool {
        matches!(lock(&self.state).phase, BusPhase::Ready)
    }

    /// Marshal a message and queue it according to the connection phase.
    pub(crate) fn send_message(&self, mut message: Message) -> Result<u32> {
        if message.serial() == 0 {
            message = message.with_serial(self.next_serial());
        }

        if !message.unix_fds().is_empty() && !self.unix_fds_negotiated.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::UnixFdsNotNegotiated));
        }

        let serial = message.serial();
        let bytes = message.marshal()?;
        let fds = message.take_unix_fds();

        let mut state = lock(&self.state);

        match state.phase {
            BusPhase::Disconnected => Err(Error::new(ErrorKind::Disconnected)),
            BusPhase::Ready => match &state.writer {
                Some(writer) if writer.send((bytes, fds)).is_ok() => Ok(serial),
                _ => Err(Error::new(ErrorKind::Disconnected)),
            },
            _ => {
                state.buffered.push((bytes, fds));
                Ok(serial)
            }
        }
    }

    /// Send a message straight to the writer, bypassing the pre-ready
    /// buffer. Used for the `Hello` exchange.
    fn send_direct(&self, mut message: Message) -> Result<u32> {
        if message.serial() == 0 {
            message = message.with_serial(self.next_serial());
        }

        let serial = message.serial();
        let bytes = message.marshal()?;
        let fds = message.take_unix_fds();

        let state = lock(&self.state);

        match &state.writer {
            Some(writer) if writer.send((bytes, fds)).is_ok() => Ok(serial),
            _ => Err(Error::new(ErrorKind::Disconnected)),
        }
    }

    /// Send a method call whose reply is delivered to the given callback.
    ///
    /// The callback fires exactly once, with the reply or with the
    /// disconnection error.
    pub(crate) fn call_with_callback(
        self: &Arc<Self>,
        mut message: Message,
        callback: Box<dyn FnOnce(Result<Message>) + Send>,
    ) -> Result<()> {
        if message.serial() == 0 {
            message = message.with_serial(self.next_serial());
        }

        let serial = message.serial();

        lock(&self.replies).insert(
            serial,
            PendingCall {
                destination: message.destination().map(str::to_owned),
                responder: Responder::Callback(callback),
            },
        );

        if let Err(error) = self.send_message(message) {
            lock(&self.replies).remove(&serial);
            return Err(error);
        }

        Ok(())
    }

    /// Add a signal subscription, installing the daemon-side match rule and
    /// seeding the name owner cache when this is the first subscriber of
    /// the `(sender, interface, path)` triple.
    pub(crate) fn add_signal_subscription(
        self: &Arc<Self>,
        sender: &str,
        path: &str,
        interface: &str,
        member: &str,
        signature: &str,
        handler: SignalHandler,
    ) -> Result<SubscriptionId> {
        validators::assert_bus_name_valid(sender)?;
        validators::assert_object_path_valid(path)?;
        validators::assert_interface_name_valid(interface)?;
        validators::assert_member_name_valid(member)?;

        let (id, rule, first) =
            lock(&self.subscriptions).add(sender, path, interface, member, signature, handler);

        if !first {
            return Ok(id);
        }

        if !sender.starts_with(':') && !lock(&self.name_owners).contains_key(sender) {
            let message = Message::method_call(org_freedesktop_dbus::PATH, "GetNameOwner")?
                .with_destination(org_freedesktop_dbus::DESTINATION)?
                .with_interface(org_freedesktop_dbus::INTERFACE)?
                .with_body("s", vec![Value::from(sender)])?;

            let weak = Arc::downgrade(self);
            let name = sender.to_owned();

            self.call_with_callback(
                message,
                Box::new(move |result| match result {
                    Ok(reply) => match reply.kind() {
                        MessageKind::MethodReturn { .. } => {
                            if let Some(Value::String(owner)) = reply.body().first() {
                                if let Some(inner) = weak.upgrade() {
                                    lock(&inner.name_owners).insert(name, owner.clone());
                                }
                            }
                        }
                        MessageKind::Error { .. } => {
                            tracing::error!("getting name owner for `{name}` failed");
                        }
                        _ => {}
                    },
                    Err(error) => {
                        tracing::error!("getting name owner for `{name}` failed: {error}");
                    }
                }),
            )?;
        }

        let message = Message::method_call(org_freedesktop_dbus::PATH, "AddMatch")?
            .with_destination(org_freedesktop_dbus::DESTINATION)?
            .with_interface(org_freedesktop_dbus::INTERFACE)?
            .with_body("s", vec![Value::from(rule.as_str())])?;

        let log_rule = rule;

        self.call_with_callback(
            message,
            Box::new(move |result| {
                let failed = match &result {
                    Ok(reply) => matches!(reply.kind(), MessageKind::Error { .. }),
                    Err(..) => true,
                };

                if failed {
                    tracing::error!("add match request failed. match=\"{log_rule}\"");
                }
            }),
        )?;

        Ok(id)
    }

    /// Remove a signal subscription, removing the daemon-side match rule
    /// when the last subscriber of its triple goes away.
    pub(crate) fn remove_signal_subscription(self: &Arc<Self>, id: SubscriptionId) {
        let Some((rule, last)) = lock(&self.subscriptions).remove(id) else {
            return;
        };

        if !last {
            return;
        }

        let result = (|| {
            let message = Message::method_call(org_freedesktop_dbus::PATH, "RemoveMatch")?
                .with_destination(org_freedesktop_dbus::DESTINATION)?
                .with_interface(org_freedesktop_dbus::INTERFACE)?
                .with_body("s", vec![Value::from(rule.as_str())])?;

            let log_rule = rule.clone();

            self.call_with_callback(
                message,
                Box::new(move |result| {
                    let failed = match &result {
                        Ok(reply) => matches!(reply.kind(), MessageKind::Error { .. }),
                        Err(..) => true,
                    };

                    if failed {
                        tracing::error!("remove match request failed. match=\"{log_rule}\"");
                    }
                }),
            )
        })();

        if let Err(error) = result {
            tracing::error!("failed to remove match rule: {error}");
        }
    }

    /// Emit a signal from an interface at every path it is exported on.
    pub(crate) fn interface_signal_notify(
        &self,
        interface: &ServiceInterface,
        interface_name: &str,
        member: &str,
        signature: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        let paths = {
            let exports = lock(&self.exports);

            exports
                .iter()
                .filter(|(.., interfaces)| {
                    interfaces
                        .iter()
                        .any(|i| std::ptr::eq(Arc::as_ptr(i), interface))
                })
                .map(|(path, ..)| path.clone())
                .collect::<Vec<_>>()
        };

        for path in paths {
            let message =
                Message::new_signal(&path, interface_name, member, signature, body.clone())?;
            self.send_message(message)?;
        }

        Ok(())
    }

    /// Transition to the terminal disconnected state.
    ///
    /// Every pending call completes exactly once with a disconnection
    /// error and exported objects are released. Safe to call more than
    /// once.
    pub(crate) fn finalize(&self) {
        {
            let mut state = lock(&self.state);

            if matches!(state.phase, BusPhase::Disconnected) {
                return;
            }

            state.phase = BusPhase::Disconnected;
            state.writer = None;
            state.buffered.clear();
        }

        let pending = std::mem::take(&mut *lock(&self.replies));

        for (.., call) in pending {
            call.responder
                .complete(Err(Error::new(ErrorKind::Disconnected)));
        }

        let exports = std::mem::take(&mut *lock(&self.exports));
        let this = self as *const BusInner;

        for (.., interfaces) in exports {
            for interface in interfaces {
                interface.remove_bus(this);
            }
        }

        let _ = self.disconnected.send(true);
    }

    /// Route one incoming message.
    fn dispatch(self: &Arc<Self>, message: Message) {
        if let Err(error) = self.process_message(message) {
            tracing::error!("got unexpected error processing a message: {error}");
        }
    }

    fn process_message(self: &Arc<Self>, message: Message) -> Result<()> {
        let mut handled = false;

        let handlers = lock(&self.handlers)
            .iter()
            .map(|(.., handler)| handler.clone())
            .collect::<Vec<_>>();

        for handler in handlers {
            let mut handler = lock(&handler);
            let result = (*handler)(&message);
            drop(handler);

            match result {
                Ok(HandlerResult::Pass) => continue,
                Ok(HandlerResult::Handled) => {
                    handled = true;
                    break;
                }
                Ok(HandlerResult::Reply(reply)) => {
                    self.send_message(reply)?;
                    handled = true;
                    break;
                }
                Err(error) => {
                    let reply = match error.as_dbus_error() {
                        Some(error) => error.as_reply(&message),
                        None => Message::new_error(
                            &message,
                            DBusError::INTERNAL_ERROR,
                            &format!("An internal error occurred: {error}"),
                        ),
                    };

                    match reply {
                        Ok(reply) => {
                            self.send_message(reply)?;
                        }
                        Err(error) => {
                            tracing::error!("message handler failed without a reply: {error}");
                        }
                    }
                }
            }
        }

        match message.kind() {
            MessageKind::Signal { .. } => self.process_signal(&message),
            MessageKind::MethodCall { .. } => {
                if handled {
                    return Ok(());
                }

                self.process_method_call(message)
            }
            MessageKind::MethodReturn { .. } | MessageKind::Error { .. } => {
                let Some(reply_serial) = message.reply_serial() else {
                    return Ok(());
                };

                let Some(call) = lock(&self.replies).remove(&reply_serial.get()) else {
                    return Ok(());
                };

                let is_return = matches!(message.kind(), MessageKind::MethodReturn { .. });

                if let (Some(destination), Some(sender), true) =
                    (call.destination.as_deref(), message.sender(), is_return)
                {
                    lock(&self.name_owners).insert(destination.to_owned(), sender.to_owned());
                }

                if !handled {
                    call.responder.complete(Ok(message));
                }

                Ok(())
            }
        }
    }

    fn process_signal(&self, message: &Message) -> Result<()> {
        // Track name owners from the daemon's NameOwnerChanged. Updates are
        // applied in arrival order and the cache is advisory only.
        if message.sender() == Some(org_freedesktop_dbus::DESTINATION)
            && message.path() == Some(org_freedesktop_dbus::PATH)
            && message.interface() == Some(org_freedesktop_dbus::INTERFACE)
            && message.member() == Some("NameOwnerChanged")
        {
            if let [Value::String(name), Value::String(..), Value::String(new_owner)] =
                message.body()
            {
                let mut owners = lock(&self.name_owners);

                if new_owner.is_empty() {
                    owners.remove(name.as_str());
                } else {
                    owners.insert(name.clone(), new_owner.clone());
                }
            }
        }

        let handlers = {
            let subscriptions = lock(&self.subscriptions);
            let owners = lock(&self.name_owners);

            subscriptions
                .entries
                .iter()
                .filter(|subscription| {
                    if message.interface() != Some(subscription.interface.as_str())
                        || message.path() != Some(subscription.path.as_str())
                        || message.member() != Some(subscription.member.as_str())
                    {
                        return false;
                    }

                    // The exact sender comparison comes first, the owner
                    // cache is advisory.
                    let sender_matches = match message.sender() {
                        Some(sender) => {
                            sender == subscription.sender
                                || owners.get(&subscription.sender).map(String::as_str)
                                    == Some(sender)
                        }
                        None => false,
                    };

                    if !sender_matches {
                        return false;
                    }

                    if message.signature().signature() != subscription.signature {
                        tracing::warn!(
                            "got signal `{}.{}` with unexpected signature `{}`",
                            subscription.interface,
                            subscription.member,
                            message.signature()
                        );

                        return false;
                    }

                    true
                })
                .map(|subscription| subscription.handler.clone())
                .collect::<Vec<_>>()
        };

        for handler in handlers {
            let mut handler = lock(&handler);
            (*handler)(message);
        }

        Ok(())
    }

    fn process_method_call(self: &Arc<Self>, message: Message) -> Result<()> {
        let interface = message.interface().map(str::to_owned);
        let member = message.member().unwrap_or_default().to_owned();
        let signature = message.signature().signature().to_owned();

        match (interface.as_deref(), member.as_str()) {
            (Some(org_freedesktop_dbus::INTROSPECTABLE), "Introspect")
                if signature.is_empty() =>
            {
                let result = self.handle_introspect(&message);
                self.send_reply_or_error(&message, result)
            }
            (Some(org_freedesktop_dbus::PROPERTIES), ..) => {
                let result = self.handle_properties(&message);
                self.send_reply_or_error(&message, result)
            }
            (Some(org_freedesktop_dbus::PEER), "Ping") if signature.is_empty() => {
                let result = self.handle_ping(&message);
                self.send_reply_or_error(&message, result)
            }
            (Some(org_freedesktop_dbus::PEER), "GetMachineId") if signature.is_empty() => {
                self.handle_get_machine_id(message)
            }
            (Some(org_freedesktop_dbus::OBJECT_MANAGER), "GetManagedObjects")
                if signature.is_empty() =>
            {
                let result = self.handle_get_managed_objects(&message);
                self.send_reply_or_error(&message, result)
            }
            _ => {
                let path = message.path().unwrap_or_default();

                let found = {
                    let exports = lock(&self.exports);

                    exports.get(path).and_then(|interfaces| {
                        interfaces
                            .iter()
                            .find(|i| {
                                Some(i.name()) == interface.as_deref()
                                    && i.find_method(&member, &signature).is_some()
                            })
                            .cloned()
                    })
                };

                let Some(found) = found else {
                    let text = format!(
                        "{}.{member} with signature \"{signature}\" could not be found",
                        interface.as_deref().unwrap_or_default(),
                    );

                    let reply = Message::new_error(&message, DBusError::UNKNOWN_METHOD, &text)?;
                    self.send_message(reply)?;
                    return Ok(());
                };

                let result = match found.find_method(&member, &signature) {
                    Some(method) => (method.handler)(message.body()).and_then(|body| {
                        Message::new_method_return(
                            &message,
                            method.out_signature.signature(),
                            body,
                        )
                    }),
                    None => Message::new_error(
                        &message,
                        DBusError::UNKNOWN_METHOD,
                        "method disappeared while dispatching",
                    ),
                };

                self.send_reply_or_error(&message, result)
            }
        }
    }

    /// Send a handler outcome: the reply on success, an error reply carrying
    /// the declared name for structured errors, and a generic service error
    /// otherwise.
    fn send_reply_or_error(&self, message: &Message, result: Result<Message>) -> Result<()> {
        let reply = match result {
            Ok(reply) => reply,
            Err(error) => match error.as_dbus_error() {
                Some(error) => error.as_reply(message)?,
                None => Message::new_error(
                    message,
                    DBusError::SERVICE_ERROR,
                    &format!("The service interface raised an error: {error}"),
                )?,
            },
        };

        self.send_message(reply)?;
        Ok(())
    }
}

async fn read_task(
    inner: Arc<BusInner>,
    fd: AsyncFd<Transport>,
    mut unmarshaller: Unmarshaller,
) {
    let error = 'outer: loop {
        loop {
            match unmarshaller.try_advance() {
                Ok(Progress::Done(message)) => inner.dispatch(message),
                Ok(Progress::NeedMore(..)) => break,
                Ok(Progress::Eof) => break 'outer None,
                Err(error) => break 'outer Some(error),
            }
        }

        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(error) => break Some(error.into()),
        };

        let mut chunk = [0u8; 4096];
        let mut fds = Vec::new();

        match guard.try_io(|fd| fd.get_ref().recv_with_fds(&mut chunk, &mut fds)) {
            Ok(Ok(0)) => unmarshaller.feed_eof(),
            Ok(Ok(n)) => {
                unmarshaller.feed(&chunk[..n]);
                unmarshaller.feed_fds(fds);
            }
            Ok(Err(error)) => break Some(error.into()),
            // Spurious readiness.
            Err(..) => continue,
        }
    };

    match error {
        Some(error) => tracing::error!("connection failed: {error}"),
        None => tracing::debug!("connection closed"),
    }

    inner.finalize();
}

async fn write_task(
    inner: Weak<BusInner>,
    fd: AsyncFd<Transport>,
    mut receiver: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some((bytes, fds)) = receiver.recv().await {
        if let Err(error) = write_frame(&fd, &bytes, &fds).await {
            tracing::error!("failed to write message: {error}");

            if let Some(inner) = inner.upgrade() {
                inner.finalize();
            }

            return;
        }
    }
}

/// Write a full frame, passing its descriptors along with the first bytes.
async fn write_frame(fd: &AsyncFd<Transport>, bytes: &[u8], fds: &[OwnedFd]) -> std::io::Result<()> {
    let mut at = 0;
    let mut fds_pending = !fds.is_empty();

    while at < bytes.len() {
        let mut guard = fd.writable().await?;

        let borrowed = if fds_pending {
            fds.iter().map(AsFd::as_fd).collect::<Vec<BorrowedFd<'_>>>()
        } else {
            Vec::new()
        };

        match guard.try_io(|fd| fd.get_ref().send_with_fds(&bytes[at..], &borrowed)) {
            Ok(n) => {
                let n = n?;
                at += n;

                if n > 0 {
                    fds_pending = false;
                }
            }
            // Spurious readiness.
            Err(..) => continue,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests;
