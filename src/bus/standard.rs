//! The standard interfaces the bus answers for every exported path without
//! user code.

use std::sync::Arc;

use crate::error::{DBusError, Result};
use crate::introspection::Node;
use crate::message::{Message, MessageKind};
use crate::org_freedesktop_dbus;
use crate::service::ServiceInterface;
use crate::utils::lock;
use crate::value::{Value, Variant};

use super::BusInner;

impl BusInner {
    /// `org.freedesktop.DBus.Introspectable.Introspect`.
    pub(super) fn handle_introspect(&self, message: &Message) -> Result<Message> {
        let path = message.path().unwrap_or("/");
        let node = self.introspect_export_path(path);
        Message::new_method_return(message, "s", vec![Value::from(node.to_xml())])
    }

    /// Synthesize the introspection document for a path: its exported
    /// interfaces plus the immediate children implied by deeper exports.
    pub(super) fn introspect_export_path(&self, path: &str) -> Node {
        let exports = lock(&self.exports);

        let mut node = match exports.get(path) {
            Some(interfaces) => {
                let mut node = Node::default_root(Some(path));

                for interface in interfaces {
                    node.interfaces.push(interface.introspect());
                }

                node
            }
            None => Node::new(Some(path)),
        };

        let segments = path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
        let mut children = Vec::new();

        for export_path in exports.keys() {
            let export_segments = export_path
                .split('/')
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>();

            if export_segments.len() <= segments.len() {
                continue;
            }

            if export_segments[..segments.len()] != segments[..] {
                continue;
            }

            let child = export_segments[segments.len()];

            if !children.contains(&child) {
                children.push(child);
            }
        }

        for child in children {
            node.nodes.push(Node::new(Some(child)));
        }

        node
    }

    /// `org.freedesktop.DBus.Peer.Ping`.
    pub(super) fn handle_ping(&self, message: &Message) -> Result<Message> {
        Message::new_method_return(message, "", Vec::new())
    }

    /// `org.freedesktop.DBus.Peer.GetMachineId`.
    ///
    /// The machine id is fetched from the bus daemon on first use and cached,
    /// so the reply may be deferred until the daemon answers.
    pub(super) fn handle_get_machine_id(self: &Arc<Self>, message: Message) -> Result<()> {
        if let Some(machine_id) = lock(&self.machine_id).clone() {
            let reply = Message::new_method_return(&message, "s", vec![Value::String(machine_id)])?;
            self.send_message(reply)?;
            return Ok(());
        }

        let request = Message::method_call(org_freedesktop_dbus::PATH, "GetMachineId")?
            .with_destination(org_freedesktop_dbus::DESTINATION)?
            .with_interface(org_freedesktop_dbus::PEER)?;

        let weak = Arc::downgrade(self);

        self.call_with_callback(
            request,
            Box::new(move |result| {
                let Some(bus) = weak.upgrade() else {
                    return;
                };

                let reply = match result {
                    Ok(reply) => reply,
                    // The bus has been disconnected, there is nobody left to
                    // reply to.
                    Err(..) => return,
                };

                let outcome = match reply.kind() {
                    MessageKind::MethodReturn { .. } => match reply.body().first() {
                        Some(Value::String(machine_id)) => {
                            *lock(&bus.machine_id) = Some(machine_id.clone());

                            Message::new_method_return(
                                &message,
                                "s",
                                vec![Value::String(machine_id.clone())],
                            )
                        }
                        _ => Message::new_error(
                            &message,
                            DBusError::FAILED,
                            "could not get machine_id",
                        ),
                    },
                    MessageKind::Error { error_name, .. } => {
                        let text = match reply.body().first() {
                            Some(Value::String(text)) => text.clone(),
                            _ => String::new(),
                        };

                        Message::new_error(&message, error_name, &text)
                    }
                    _ => Message::new_error(&message, DBusError::FAILED, "could not get machine_id"),
                };

                match outcome {
                    Ok(reply) => {
                        if let Err(error) = bus.send_message(reply) {
                            tracing::error!("failed to reply to GetMachineId: {error}");
                        }
                    }
                    Err(error) => {
                        tracing::error!("failed to build GetMachineId reply: {error}");
                    }
                }
            }),
        )
    }

    /// `org.freedesktop.DBus.Properties.{Get, Set, GetAll}`.
    pub(super) fn handle_properties(&self, message: &Message) -> Result<Message> {
        let member = message.member().unwrap_or_default();

        let expected = match member {
            "Get" => "ss",
            "Set" => "ssv",
            "GetAll" => "s",
            _ => "",
        };

        if expected.is_empty() || message.signature().signature() != expected {
            return Err(DBusError::new(
                DBusError::UNKNOWN_METHOD,
                format!(
                    "properties interface doesn't have method `{member}` with signature `{}`",
                    message.signature()
                ),
            )?
            .into());
        }

        let Some(Value::String(interface_name)) = message.body().first() else {
            return Err(DBusError::new(
                DBusError::INVALID_ARGS,
                "expected an interface name as the first argument",
            )?
            .into());
        };

        if interface_name.is_empty() {
            return Err(DBusError::new(
                DBusError::NOT_SUPPORTED,
                "getting and setting properties with an empty interface string is not supported",
            )?
            .into());
        }

        let path = message.path().unwrap_or_default();

        let interface = {
            let exports = lock(&self.exports);

            let Some(interfaces) = exports.get(path) else {
                return Err(DBusError::new(
                    DBusError::UNKNOWN_OBJECT,
                    format!("no interfaces at path: `{path}`"),
                )?
                .into());
            };

            interfaces
                .iter()
                .find(|interface| interface.name() == interface_name.as_str())
                .cloned()
        };

        let Some(interface) = interface else {
            return Err(DBusError::new(
                DBusError::UNKNOWN_INTERFACE,
                format!("could not find an interface `{interface_name}` at path: `{path}`"),
            )?
            .into());
        };

        match member {
            "Get" | "Set" => {
                let Some(Value::String(property_name)) = message.body().get(1) else {
                    return Err(DBusError::new(
                        DBusError::INVALID_ARGS,
                        "expected a property name as the second argument",
                    )?
                    .into());
                };

                let Some(property) = interface.find_property(property_name) else {
                    return Err(DBusError::new(
                        DBusError::UNKNOWN_PROPERTY,
                        format!(
                            "interface `{interface_name}` does not have property `{property_name}`"
                        ),
                    )?
                    .into());
                };

                if member == "Get" {
                    if !property.access.readable() {
                        return Err(DBusError::new(
                            DBusError::UNKNOWN_PROPERTY,
                            "the property does not have read access",
                        )?
                        .into());
                    }

                    let value = (property.getter)()?;
                    let variant = Variant::new(property.signature.signature(), value)?;

                    return Message::new_method_return(
                        message,
                        "v",
                        vec![Value::Variant(variant)],
                    );
                }

                if !property.access.writable() {
                    return Err(DBusError::new(
                        DBusError::PROPERTY_READ_ONLY,
                        "the property is readonly",
                    )?
                    .into());
                }

                let Some(Value::Variant(variant)) = message.body().get(2) else {
                    return Err(DBusError::new(
                        DBusError::INVALID_ARGS,
                        "expected a variant as the third argument",
                    )?
                    .into());
                };

                if variant.signature() != property.signature.signature() {
                    return Err(DBusError::new(
                        DBusError::INVALID_SIGNATURE,
                        format!(
                            "wrong signature for property. expected `{}`",
                            property.signature
                        ),
                    )?
                    .into());
                }

                // Writable properties are guaranteed a setter when the
                // interface is built.
                if let Some(setter) = &property.setter {
                    setter(variant.value().clone())?;
                }

                Message::new_method_return(message, "", Vec::new())
            }
            _ => {
                let entries = readable_properties(&interface)?;
                Message::new_method_return(message, "a{sv}", vec![Value::Dict(entries)])
            }
        }
    }

    /// `org.freedesktop.DBus.ObjectManager.GetManagedObjects`.
    pub(super) fn handle_get_managed_objects(&self, message: &Message) -> Result<Message> {
        let path = message.path().unwrap_or("/");

        let descendants = {
            let exports = lock(&self.exports);

            exports
                .iter()
                .filter(|(export_path, ..)| is_descendant(path, export_path))
                .map(|(export_path, interfaces)| (export_path.clone(), interfaces.clone()))
                .collect::<Vec<_>>()
        };

        let mut objects = Vec::with_capacity(descendants.len());

        for (export_path, interfaces) in descendants {
            let mut by_interface = Vec::with_capacity(interfaces.len());

            for interface in interfaces {
                by_interface.push((
                    Value::from(interface.name()),
                    Value::Dict(readable_properties(&interface)?),
                ));
            }

            objects.push((Value::ObjectPath(export_path), Value::Dict(by_interface)));
        }

        Message::new_method_return(message, "a{oa{sa{sv}}}", vec![Value::Dict(objects)])
    }

    /// Emit `InterfacesAdded` for a freshly exported interface.
    pub(super) fn emit_interfaces_added(&self, path: &str, interface: &Arc<ServiceInterface>) {
        if !self.is_ready() {
            return;
        }

        let result = (|| {
            let properties = readable_properties(interface)?;

            let body = vec![
                Value::ObjectPath(path.to_owned()),
                Value::Dict(vec![(
                    Value::from(interface.name()),
                    Value::Dict(properties),
                )]),
            ];

            let message = Message::new_signal(
                path,
                org_freedesktop_dbus::OBJECT_MANAGER,
                "InterfacesAdded",
                "oa{sa{sv}}",
                body,
            )?;

            self.send_message(message)
        })();

        if let Err(error) = result {
            tracing::error!("failed to emit InterfacesAdded for `{path}`: {error}");
        }
    }

    /// Emit `InterfacesRemoved` for interfaces dropped from a path.
    pub(super) fn emit_interfaces_removed(&self, path: &str, interfaces: &[Arc<ServiceInterface>]) {
        if !self.is_ready() || interfaces.is_empty() {
            return;
        }

        let names = interfaces
            .iter()
            .map(|interface| Value::from(interface.name()))
            .collect::<Vec<_>>();

        let result = Message::new_signal(
            path,
            org_freedesktop_dbus::OBJECT_MANAGER,
            "InterfacesRemoved",
            "oas",
            vec![Value::ObjectPath(path.to_owned()), Value::Array(names)],
        )
        .and_then(|message| self.send_message(message));

        if let Err(error) = result {
            tracing::error!("failed to emit InterfacesRemoved for `{path}`: {error}");
        }
    }
}

/// Collect the values of all enabled, readable properties of an interface as
/// `a{sv}` entries.
fn readable_properties(interface: &ServiceInterface) -> Result<Vec<(Value, Value)>> {
    let mut entries = Vec::new();

    for property in interface.properties() {
        if property.disabled || !property.access.readable() {
            continue;
        }

        let value = (property.getter)()?;

        entries.push((
            Value::from(property.name.as_str()),
            Value::Variant(Variant::new(property.signature.signature(), value)?),
        ));
    }

    Ok(entries)
}

/// Test if `candidate` is a strict descendant of `path`.
fn is_descendant(path: &str, candidate: &str) -> bool {
    if path == candidate {
        return false;
    }

    if path == "/" {
        return true;
    }

    candidate.len() > path.len()
        && candidate.starts_with(path)
        && candidate.as_bytes()[path.len()] == b'/'
}
