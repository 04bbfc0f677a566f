//! Declarative local objects exported over the bus.
//!
//! A [`ServiceInterface`] is built once from method, signal and property
//! definitions and can then be exported on any number of buses, at any number
//! of paths. Signal emission fans out to every bus the interface is exported
//! on.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::bus::BusInner;
use crate::error::{Error, ErrorKind, Result};
use crate::introspection;
use crate::introspection::{Arg, ArgDirection, PropertyAccess};
use crate::org_freedesktop_dbus;
use crate::signature::SignatureTree;
use crate::utils::lock;
use crate::validators;
use crate::value::{Value, Variant};

/// The handler of a service method. Receives the body of the incoming call
/// and returns the body of the reply.
pub type MethodHandler = Box<dyn Fn(&[Value]) -> Result<Vec<Value>> + Send + Sync>;

/// The getter of a service property.
pub type PropertyGetter = Box<dyn Fn() -> Result<Value> + Send + Sync>;

/// The setter of a service property.
pub type PropertySetter = Box<dyn Fn(Value) -> Result<()> + Send + Sync>;

/// The definition of a single method.
pub struct MethodDef {
    name: String,
    in_signature: String,
    out_signature: String,
    handler: MethodHandler,
    disabled: bool,
}

impl MethodDef {
    /// Define a method with the given in and out signatures.
    ///
    /// A handler failing with a [`DBusError`] is converted into an error
    /// reply carrying its name, any other failure becomes a
    /// `se.tedro.DBusNext.ServiceError` reply.
    ///
    /// [`DBusError`]: crate::DBusError
    pub fn new(
        name: &str,
        in_signature: &str,
        out_signature: &str,
        handler: impl Fn(&[Value]) -> Result<Vec<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_owned(),
            in_signature: in_signature.to_owned(),
            out_signature: out_signature.to_owned(),
            handler: Box::new(handler),
            disabled: false,
        }
    }

    /// Mark the method as disabled. A disabled method is not exposed over
    /// the wire.
    #[must_use]
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

/// The definition of a single signal.
pub struct SignalDef {
    name: String,
    signature: String,
    disabled: bool,
}

impl SignalDef {
    /// Define a signal with the given signature.
    pub fn new(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_owned(),
            signature: signature.to_owned(),
            disabled: false,
        }
    }

    /// Mark the signal as disabled. Emitting a disabled signal is an error.
    #[must_use]
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

/// The definition of a single property.
pub struct PropertyDef {
    name: String,
    signature: String,
    access: PropertyAccess,
    getter: Option<PropertyGetter>,
    setter: Option<PropertySetter>,
    disabled: bool,
}

impl PropertyDef {
    /// Define a property with the given signature and access mode.
    pub fn new(
        name: &str,
        signature: &str,
        access: PropertyAccess,
        getter: impl Fn() -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_owned(),
            signature: signature.to_owned(),
            access,
            getter: Some(Box::new(getter)),
            setter: None,
            disabled: false,
        }
    }

    /// Install a setter for the property. Required when the access mode is
    /// writable.
    #[must_use]
    pub fn with_setter(mut self, setter: impl Fn(Value) -> Result<()> + Send + Sync + 'static) -> Self {
        self.setter = Some(Box::new(setter));
        self
    }

    /// Mark the property as disabled. A disabled property is not exposed
    /// over the wire.
    #[must_use]
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) in_signature: SignatureTree,
    pub(crate) out_signature: SignatureTree,
    pub(crate) handler: MethodHandler,
    pub(crate) disabled: bool,
}

pub(crate) struct Signal {
    pub(crate) name: String,
    pub(crate) signature: SignatureTree,
    pub(crate) disabled: bool,
}

pub(crate) struct Property {
    pub(crate) name: String,
    pub(crate) signature: SignatureTree,
    pub(crate) access: PropertyAccess,
    pub(crate) getter: PropertyGetter,
    pub(crate) setter: Option<PropertySetter>,
    pub(crate) disabled: bool,
}

/// Builder for a [`ServiceInterface`].
pub struct ServiceInterfaceBuilder {
    name: String,
    methods: Vec<MethodDef>,
    signals: Vec<SignalDef>,
    properties: Vec<PropertyDef>,
}

impl ServiceInterfaceBuilder {
    /// Add a method to the interface.
    #[must_use]
    pub fn method(mut self, def: MethodDef) -> Self {
        self.methods.push(def);
        self
    }

    /// Add a signal to the interface.
    #[must_use]
    pub fn signal(mut self, def: SignalDef) -> Self {
        self.signals.push(def);
        self
    }

    /// Add a property to the interface.
    #[must_use]
    pub fn property(mut self, def: PropertyDef) -> Self {
        self.properties.push(def);
        self
    }

    /// Validate the definitions and build the interface.
    pub fn build(self) -> Result<Arc<ServiceInterface>> {
        validators::assert_interface_name_valid(&self.name)?;

        let mut methods = Vec::with_capacity(self.methods.len());

        for def in self.methods {
            validators::assert_member_name_valid(&def.name)?;

            methods.push(Method {
                name: def.name,
                in_signature: SignatureTree::new(&def.in_signature)?,
                out_signature: SignatureTree::new(&def.out_signature)?,
                handler: def.handler,
                disabled: def.disabled,
            });
        }

        let mut signals = Vec::with_capacity(self.signals.len());

        for def in self.signals {
            validators::assert_member_name_valid(&def.name)?;

            signals.push(Signal {
                name: def.name,
                signature: SignatureTree::new(&def.signature)?,
                disabled: def.disabled,
            });
        }

        let mut properties = Vec::with_capacity(self.properties.len());

        for def in self.properties {
            validators::assert_member_name_valid(&def.name)?;

            if def.access.writable() && def.setter.is_none() {
                return Err(Error::new(ErrorKind::InvalidIntrospection(
                    format!(
                        "property `{}` is writable but does not have a setter",
                        def.name
                    )
                    .into(),
                )));
            }

            let Some(getter) = def.getter else {
                return Err(Error::new(ErrorKind::InvalidIntrospection(
                    format!("property `{}` does not have a getter", def.name).into(),
                )));
            };

            let signature = SignatureTree::new(&def.signature)?;

            if signature.types().len() != 1 {
                return Err(Error::new(ErrorKind::InvalidIntrospection(
                    format!(
                        "the signature of property `{}` must be a single complete type",
                        def.name
                    )
                    .into(),
                )));
            }

            properties.push(Property {
                name: def.name,
                signature,
                access: def.access,
                getter,
                setter: def.setter,
                disabled: def.disabled,
            });
        }

        Ok(Arc::new(ServiceInterface {
            name: self.name,
            methods,
            signals,
            properties,
            buses: Mutex::new(Vec::new()),
        }))
    }
}

/// A declarative object interface which can be exported on a bus.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::service::{MethodDef, ServiceInterface};
///
/// let interface = ServiceInterface::builder("se.tedro.Example")
///     .method(MethodDef::new("Echo", "s", "s", |body| Ok(body.to_vec())))
///     .build()?;
///
/// assert_eq!(interface.name(), "se.tedro.Example");
/// # Ok::<_, tokio_dbus_next::Error>(())
/// ```
pub struct ServiceInterface {
    name: String,
    methods: Vec<Method>,
    signals: Vec<Signal>,
    properties: Vec<Property>,
    /// Non-owning back-references to the buses this interface is exported
    /// on, used for signal fan-out.
    buses: Mutex<Vec<Weak<BusInner>>>,
}

impl ServiceInterface {
    /// Start building an interface with the given bus-facing name.
    pub fn builder(name: &str) -> ServiceInterfaceBuilder {
        ServiceInterfaceBuilder {
            name: name.to_owned(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// The bus-facing name of the interface.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn find_method(&self, member: &str, signature: &str) -> Option<&Method> {
        self.methods.iter().find(|method| {
            !method.disabled
                && method.name == member
                && method.in_signature.signature() == signature
        })
    }

    pub(crate) fn find_property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|property| !property.disabled && property.name == name)
    }

    pub(crate) fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Emit a signal to every bus this interface is exported on.
    ///
    /// The body must conform to the declared signature of the signal.
    pub fn emit_signal(&self, member: &str, body: Vec<Value>) -> Result<()> {
        let Some(signal) = self.signals.iter().find(|signal| signal.name == member) else {
            return Err(Error::new(ErrorKind::UnknownMember(member.into())));
        };

        if signal.disabled {
            return Err(Error::new(ErrorKind::SignalDisabled));
        }

        signal.signature.verify_body(&body)?;
        self.notify_buses(&self.name, member, signal.signature.signature(), body)
    }

    /// Emit `org.freedesktop.DBus.Properties.PropertiesChanged` for this
    /// interface on every bus it is exported on.
    pub fn emit_properties_changed(
        &self,
        changed: &[(&str, Value)],
        invalidated: &[&str],
    ) -> Result<()> {
        let mut entries = Vec::with_capacity(changed.len());

        for (name, value) in changed {
            let Some(property) = self.find_property(name) else {
                return Err(Error::new(ErrorKind::UnknownMember((*name).into())));
            };

            entries.push((
                Value::from(*name),
                Value::Variant(Variant::new(property.signature.signature(), value.clone())?),
            ));
        }

        let invalidated = invalidated
            .iter()
            .map(|name| Value::from(*name))
            .collect::<Vec<_>>();

        let body = vec![
            Value::from(self.name.as_str()),
            Value::Dict(entries),
            Value::Array(invalidated),
        ];

        self.notify_buses(
            org_freedesktop_dbus::PROPERTIES,
            "PropertiesChanged",
            "sa{sv}as",
            body,
        )
    }

    fn notify_buses(
        &self,
        interface: &str,
        member: &str,
        signature: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        let buses = lock(&self.buses)
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();

        for bus in buses {
            bus.interface_signal_notify(self, interface, member, signature, body.clone())?;
        }

        Ok(())
    }

    /// Synthesize the introspection data of this interface, with disabled
    /// members omitted.
    pub fn introspect(&self) -> introspection::Interface {
        let mut interface = introspection::Interface {
            name: self.name.clone(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        };

        for method in &self.methods {
            if method.disabled {
                continue;
            }

            interface.methods.push(introspection::Method {
                name: method.name.clone(),
                in_args: args_of(&method.in_signature, ArgDirection::In),
                out_args: args_of(&method.out_signature, ArgDirection::Out),
            });
        }

        for signal in &self.signals {
            if signal.disabled {
                continue;
            }

            interface.signals.push(introspection::Signal {
                name: signal.name.clone(),
                args: args_of(&signal.signature, ArgDirection::Out),
            });
        }

        for property in &self.properties {
            if property.disabled {
                continue;
            }

            // The name and signature were validated when the interface was
            // built.
            if let Ok(property) = introspection::Property::new(
                &property.name,
                property.signature.signature(),
                property.access,
            ) {
                interface.properties.push(property);
            }
        }

        interface
    }

    pub(crate) fn add_bus(&self, bus: Weak<BusInner>) {
        let mut buses = lock(&self.buses);

        if !buses.iter().any(|b| Weak::ptr_eq(b, &bus)) {
            buses.push(bus);
        }
    }

    pub(crate) fn remove_bus(&self, bus: *const BusInner) {
        lock(&self.buses).retain(|b| !std::ptr::eq(Weak::as_ptr(b), bus));
    }
}

impl fmt::Debug for ServiceInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInterface")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn args_of(signature: &SignatureTree, direction: ArgDirection) -> Vec<Arg> {
    signature
        .types()
        .iter()
        .filter_map(|ty| Arg::new(ty.signature(), Some(direction), None).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let interface = ServiceInterface::builder("se.tedro.Example")
            .method(MethodDef::new("Echo", "s", "s", |body| Ok(body.to_vec())))
            .method(MethodDef::new("Hidden", "", "", |_| Ok(Vec::new())).with_disabled(true))
            .signal(SignalDef::new("SomeSignal", ""))
            .property(PropertyDef::new(
                "StringProp",
                "s",
                PropertyAccess::Read,
                || Ok(Value::from("kevin")),
            ))
            .build()
            .unwrap();

        assert!(interface.find_method("Echo", "s").is_some());
        assert!(interface.find_method("Echo", "u").is_none());
        assert!(interface.find_method("Hidden", "").is_none());
        assert!(interface.find_property("StringProp").is_some());
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(ServiceInterface::builder("nodots").build().is_err());

        let result = ServiceInterface::builder("se.tedro.Example")
            .method(MethodDef::new("has.dot", "", "", |_| Ok(Vec::new())))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_writable_property_requires_setter() {
        let result = ServiceInterface::builder("se.tedro.Example")
            .property(PropertyDef::new(
                "Prop",
                "s",
                PropertyAccess::ReadWrite,
                || Ok(Value::from("")),
            ))
            .build();

        assert!(result.is_err());

        let result = ServiceInterface::builder("se.tedro.Example")
            .property(
                PropertyDef::new("Prop", "s", PropertyAccess::ReadWrite, || {
                    Ok(Value::from(""))
                })
                .with_setter(|_| Ok(())),
            )
            .build();

        assert!(result.is_ok());
    }

    #[test]
    fn test_introspect_hides_disabled_members() {
        let interface = ServiceInterface::builder("se.tedro.Example")
            .method(MethodDef::new("Visible", "s", "", |_| Ok(Vec::new())))
            .method(MethodDef::new("Hidden", "", "", |_| Ok(Vec::new())).with_disabled(true))
            .signal(SignalDef::new("Gone", "s").with_disabled(true))
            .build()
            .unwrap();

        let introspected = interface.introspect();
        assert_eq!(introspected.methods.len(), 1);
        assert_eq!(introspected.methods[0].name, "Visible");
        assert_eq!(introspected.methods[0].in_signature(), "s");
        assert!(introspected.signals.is_empty());
    }

    #[test]
    fn test_emit_disabled_signal() {
        let interface = ServiceInterface::builder("se.tedro.Example")
            .signal(SignalDef::new("Gone", "").with_disabled(true))
            .build()
            .unwrap();

        assert!(interface.emit_signal("Gone", Vec::new()).is_err());
        assert!(interface.emit_signal("Missing", Vec::new()).is_err());
    }

    #[test]
    fn test_emit_signal_verifies_body() {
        let interface = ServiceInterface::builder("se.tedro.Example")
            .signal(SignalDef::new("ValueChanged", "u"))
            .build()
            .unwrap();

        assert!(interface
            .emit_signal("ValueChanged", vec![Value::from("no")])
            .is_err());

        // Not exported anywhere, so a conforming body fans out to no bus.
        assert!(interface
            .emit_signal("ValueChanged", vec![Value::Uint32(1)])
            .is_ok());
    }
}
