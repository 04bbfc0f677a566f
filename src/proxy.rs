//! Client-side façades over objects exported by remote peers.
//!
//! A [`ProxyObject`] is built from the introspection data of a
//! `(bus_name, path)` pair. Its [`ProxyInterface`]s expose remote methods,
//! properties and signals through `(member, args)` lookups against that
//! data.

use crate::bus::{MessageBus, SignalHandler, SubscriptionId};
use crate::error::{DBusError, Error, ErrorKind, Result};
use crate::introspection;
use crate::message::{Message, MessageKind};
use crate::org_freedesktop_dbus;
use crate::validators;
use crate::value::{Value, Variant};

/// A remote object, described by its introspection data.
///
/// # Examples
///
/// ```no_run
/// use tokio_dbus_next::{MessageBus, Value};
///
/// # #[tokio::main] async fn main() -> tokio_dbus_next::Result<()> {
/// let bus = MessageBus::session_bus()?;
/// bus.connect().await?;
///
/// let node = bus.introspect("se.tedro.Example", "/se/tedro/Example").await?;
/// let object = bus.get_proxy_object("se.tedro.Example", "/se/tedro/Example", node)?;
/// let interface = object.get_interface("se.tedro.Example")?;
///
/// let reply = interface.call("Echo", vec![Value::from("hello")]).await?;
/// assert_eq!(reply, Some(Value::from("hello")));
/// # Ok(()) }
/// ```
pub struct ProxyObject {
    bus: MessageBus,
    bus_name: String,
    path: String,
    node: introspection::Node,
}

impl ProxyObject {
    pub(crate) fn new(
        bus: MessageBus,
        bus_name: &str,
        path: &str,
        node: introspection::Node,
    ) -> Result<Self> {
        validators::assert_bus_name_valid(bus_name)?;
        validators::assert_object_path_valid(path)?;

        Ok(Self {
            bus,
            bus_name: bus_name.to_owned(),
            path: path.to_owned(),
            node,
        })
    }

    /// The bus name this object belongs to.
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// The path of this object.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The introspection data this object was built from.
    pub fn node(&self) -> &introspection::Node {
        &self.node
    }

    /// Get an interface exported on this object by name.
    pub fn get_interface(&self, name: &str) -> Result<ProxyInterface> {
        let Some(interface) = self
            .node
            .interfaces
            .iter()
            .find(|interface| interface.name == name)
        else {
            return Err(Error::new(ErrorKind::InterfaceNotFound(name.into())));
        };

        Ok(ProxyInterface {
            bus: self.bus.clone(),
            bus_name: self.bus_name.clone(),
            path: self.path.clone(),
            interface: interface.clone(),
        })
    }

    /// Get proxy objects for the children of this object.
    pub fn get_children(&self) -> Result<Vec<ProxyObject>> {
        let mut children = Vec::with_capacity(self.node.nodes.len());

        for node in &self.node.nodes {
            let Some(name) = &node.name else {
                continue;
            };

            let path = if self.path == "/" {
                format!("/{name}")
            } else {
                format!("{}/{name}", self.path)
            };

            children.push(ProxyObject::new(
                self.bus.clone(),
                &self.bus_name,
                &path,
                node.clone(),
            )?);
        }

        Ok(children)
    }
}

/// A single interface of a remote object.
pub struct ProxyInterface {
    bus: MessageBus,
    bus_name: String,
    path: String,
    interface: introspection::Interface,
}

impl ProxyInterface {
    /// The name of the interface.
    pub fn name(&self) -> &str {
        &self.interface.name
    }

    /// Call a method on the remote interface.
    ///
    /// The arguments must conform to the method's declared in-signature.
    /// Returns `None` for methods without out-arguments, the single value
    /// for one out-argument, and the values wrapped in a struct otherwise.
    ///
    /// An `ERROR` reply raises the corresponding [`DBusError`], a reply with
    /// an unexpected signature raises a client error.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Option<Value>> {
        let Some(method) = self
            .interface
            .methods
            .iter()
            .find(|method| method.name == member)
        else {
            return Err(Error::new(ErrorKind::UnknownMember(member.into())));
        };

        let message = Message::method_call(&self.path, member)?
            .with_destination(&self.bus_name)?
            .with_interface(&self.interface.name)?
            .with_body(&method.in_signature(), args)?;

        let reply = self.call_expecting_reply(message).await?;
        let reply = check_method_return(reply, &method.out_signature())?;

        let mut body = reply.into_body();

        match method.out_args.len() {
            0 => Ok(None),
            1 => Ok(Some(body.remove(0))),
            _ => Ok(Some(Value::Struct(body))),
        }
    }

    /// Get a property of the remote interface through
    /// `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        let property = self.find_property(name)?;
        let signature = property.signature().to_owned();

        let message = Message::method_call(&self.path, "Get")?
            .with_destination(&self.bus_name)?
            .with_interface(org_freedesktop_dbus::PROPERTIES)?
            .with_body(
                "ss",
                vec![Value::from(self.interface.name.as_str()), Value::from(name)],
            )?;

        let reply = self.call_expecting_reply(message).await?;
        let reply = check_method_return(reply, "v")?;

        let variant = match reply.into_body().pop() {
            Some(Value::Variant(variant)) => variant,
            _ => {
                return Err(client_error("property get did not return a variant")?);
            }
        };

        if variant.signature() != signature {
            return Err(client_error(&format!(
                "property returned unexpected signature `{}`",
                variant.signature()
            ))?);
        }

        Ok(variant.into_value())
    }

    /// Set a property of the remote interface through
    /// `org.freedesktop.DBus.Properties.Set`.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let property = self.find_property(name)?;
        let variant = Variant::new(property.signature(), value)?;

        let message = Message::method_call(&self.path, "Set")?
            .with_destination(&self.bus_name)?
            .with_interface(org_freedesktop_dbus::PROPERTIES)?
            .with_body(
                "ssv",
                vec![
                    Value::from(self.interface.name.as_str()),
                    Value::from(name),
                    Value::Variant(variant),
                ],
            )?;

        let reply = self.call_expecting_reply(message).await?;
        check_method_return(reply, "")?;
        Ok(())
    }

    /// Subscribe to a signal of the remote interface.
    ///
    /// The first subscription for the `(sender, interface, path)` triple
    /// installs a match rule at the daemon. The handler is invoked in signal
    /// arrival order, and only for signals whose sender is the subscribed
    /// name or the unique name currently owning it.
    pub fn on_signal(
        &self,
        member: &str,
        handler: impl FnMut(&Message) + Send + 'static,
    ) -> Result<SubscriptionId> {
        let Some(signal) = self
            .interface
            .signals
            .iter()
            .find(|signal| signal.name == member)
        else {
            return Err(Error::new(ErrorKind::UnknownMember(member.into())));
        };

        let handler: SignalHandler = Box::new(handler);

        self.bus.inner().add_signal_subscription(
            &self.bus_name,
            &self.path,
            &self.interface.name,
            member,
            &signal.signature(),
            handler,
        )
    }

    /// Remove a signal subscription. The daemon-side match rule is removed
    /// along with the last subscription of its triple.
    pub fn off_signal(&self, id: SubscriptionId) {
        self.bus.inner().remove_signal_subscription(id);
    }

    fn find_property(&self, name: &str) -> Result<&introspection::Property> {
        match self
            .interface
            .properties
            .iter()
            .find(|property| property.name == name)
        {
            Some(property) => Ok(property),
            None => Err(Error::new(ErrorKind::UnknownMember(name.into()))),
        }
    }

    async fn call_expecting_reply(&self, message: Message) -> Result<Message> {
        match self.bus.call(message).await? {
            Some(reply) => Ok(reply),
            None => Err(Error::new(ErrorKind::Disconnected)),
        }
    }
}

fn client_error(text: &str) -> Result<Error> {
    Ok(DBusError::new(DBusError::CLIENT_ERROR, text)?.into())
}

/// Validate a reply the way a proxy expects it: errors become structured
/// [`DBusError`]s, anything that is not a method return with the expected
/// signature is a client error.
fn check_method_return(reply: Message, signature: &str) -> Result<Message> {
    match reply.kind() {
        MessageKind::Error { .. } => Err(DBusError::from_message(reply)?.into()),
        MessageKind::MethodReturn { .. } => {
            if reply.signature().signature() != signature {
                return Err(client_error(&format!(
                    "method call returned unexpected signature: `{}`",
                    reply.signature()
                ))?);
            }

            Ok(reply)
        }
        _ => Err(client_error("method call did not return a method return")?),
    }
}
