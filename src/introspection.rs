//! The in-memory model of D-Bus introspection documents.
//!
//! Documents parse from and serialize back to the XML format described in the
//! D-Bus specification. Unknown elements and annotations are skipped when
//! parsing.

use xmlparser::{ElementEnd, Token};

use crate::error::{Error, ErrorKind, Result};
use crate::signature::SignatureType;
use crate::validators;

#[inline]
fn invalid(message: impl Into<Box<str>>) -> Error {
    Error::new(ErrorKind::InvalidIntrospection(message.into()))
}

/// The access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    /// The property can only be read.
    Read,
    /// The property can only be written.
    Write,
    /// The property can be read and written.
    ReadWrite,
}

impl PropertyAccess {
    /// Test if the property can be read.
    pub fn readable(&self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    /// Test if the property can be written.
    pub fn writable(&self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    fn as_str(&self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }

    fn from_str(access: &str) -> Result<Self> {
        match access {
            "read" => Ok(PropertyAccess::Read),
            "write" => Ok(PropertyAccess::Write),
            "readwrite" => Ok(PropertyAccess::ReadWrite),
            access => Err(invalid(format!("got unknown property access `{access}`"))),
        }
    }
}

/// The direction of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDirection {
    /// An input argument.
    In,
    /// An output argument.
    Out,
}

impl ArgDirection {
    fn as_str(&self) -> &'static str {
        match self {
            ArgDirection::In => "in",
            ArgDirection::Out => "out",
        }
    }
}

/// A method or signal argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// The name of the argument, if any.
    pub name: Option<String>,
    /// The direction of the argument.
    pub direction: Option<ArgDirection>,
    ty: SignatureType,
}

impl Arg {
    /// Construct a new argument over a single complete type.
    pub fn new(signature: &str, direction: Option<ArgDirection>, name: Option<&str>) -> Result<Self> {
        if let Some(name) = name {
            validators::assert_member_name_valid(name)?;
        }

        Ok(Self {
            name: name.map(str::to_owned),
            direction,
            ty: SignatureType::new(signature)?,
        })
    }

    /// The type of the argument.
    pub fn ty(&self) -> &SignatureType {
        &self.ty
    }

    /// The signature string of the argument.
    pub fn signature(&self) -> &str {
        self.ty.signature()
    }
}

/// A method on an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    /// The name of the method.
    pub name: String,
    /// Input arguments.
    pub in_args: Vec<Arg>,
    /// Output arguments.
    pub out_args: Vec<Arg>,
}

impl Method {
    /// Construct a new method.
    pub fn new(name: &str, in_args: Vec<Arg>, out_args: Vec<Arg>) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        Ok(Self {
            name: name.to_owned(),
            in_args,
            out_args,
        })
    }

    /// The concatenated signature of the input arguments.
    pub fn in_signature(&self) -> String {
        self.in_args.iter().map(Arg::signature).collect()
    }

    /// The concatenated signature of the output arguments.
    pub fn out_signature(&self) -> String {
        self.out_args.iter().map(Arg::signature).collect()
    }
}

/// A signal on an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// The name of the signal.
    pub name: String,
    /// The arguments of the signal.
    pub args: Vec<Arg>,
}

impl Signal {
    /// Construct a new signal.
    pub fn new(name: &str, args: Vec<Arg>) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        Ok(Self {
            name: name.to_owned(),
            args,
        })
    }

    /// The concatenated signature of the signal arguments.
    pub fn signature(&self) -> String {
        self.args.iter().map(Arg::signature).collect()
    }
}

/// A property on an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// The name of the property.
    pub name: String,
    /// The access mode of the property.
    pub access: PropertyAccess,
    ty: SignatureType,
}

impl Property {
    /// Construct a new property over a single complete type.
    pub fn new(name: &str, signature: &str, access: PropertyAccess) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        Ok(Self {
            name: name.to_owned(),
            access,
            ty: SignatureType::new(signature)?,
        })
    }

    /// The type of the property.
    pub fn ty(&self) -> &SignatureType {
        &self.ty
    }

    /// The signature string of the property.
    pub fn signature(&self) -> &str {
        self.ty.signature()
    }
}

/// An interface on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    /// The name of the interface.
    pub name: String,
    /// Methods on the interface.
    pub methods: Vec<Method>,
    /// Signals on the interface.
    pub signals: Vec<Signal>,
    /// Properties on the interface.
    pub properties: Vec<Property>,
}

impl Interface {
    /// Construct a new empty interface.
    pub fn new(name: &str) -> Result<Self> {
        validators::assert_interface_name_valid(name)?;

        Ok(Self {
            name: name.to_owned(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        })
    }
}

/// A node in the object hierarchy of a peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// The name of the node. For the root node this is an optional absolute
    /// path, for child nodes a relative path segment.
    pub name: Option<String>,
    /// Interfaces on the node.
    pub interfaces: Vec<Interface>,
    /// Immediate children of the node.
    pub nodes: Vec<Node>,
}

impl Node {
    /// Construct a new node.
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_owned),
            interfaces: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Construct a root node populated with the standard interfaces every
    /// exported object carries.
    pub fn default_root(name: Option<&str>) -> Self {
        let mut node = Self::new(name);
        node.interfaces.extend(standard_interfaces());
        node
    }

    /// Parse an introspection document.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio_dbus_next::introspection::Node;
    ///
    /// let node = Node::parse(r#"
    ///     <node>
    ///       <interface name="se.tedro.Example">
    ///         <method name="Echo">
    ///           <arg name="what" direction="in" type="s"/>
    ///           <arg direction="out" type="s"/>
    ///         </method>
    ///       </interface>
    ///     </node>
    /// "#)?;
    ///
    /// assert_eq!(node.interfaces.len(), 1);
    /// assert_eq!(node.interfaces[0].methods[0].in_signature(), "s");
    /// # Ok::<_, tokio_dbus_next::Error>(())
    /// ```
    pub fn parse(data: &str) -> Result<Self> {
        parse_document(data)
    }

    /// Serialize the node into an introspection document.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();

        out.push_str(
            "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
        );

        write_node(&mut out, self, 0);
        out
    }
}

fn standard_interfaces() -> Vec<Interface> {
    // The standard interfaces are valid by construction.
    let parse = |data: &str| Node::parse(data).map(|node| node.interfaces);

    parse(
        r#"<node>
        <interface name="org.freedesktop.DBus.Introspectable">
            <method name="Introspect">
                <arg name="data" direction="out" type="s"/>
            </method>
        </interface>
        <interface name="org.freedesktop.DBus.Peer">
            <method name="GetMachineId">
                <arg name="machine_uuid" direction="out" type="s"/>
            </method>
            <method name="Ping"/>
        </interface>
        <interface name="org.freedesktop.DBus.Properties">
            <method name="Get">
                <arg name="interface_name" direction="in" type="s"/>
                <arg name="property_name" direction="in" type="s"/>
                <arg name="value" direction="out" type="v"/>
            </method>
            <method name="Set">
                <arg name="interface_name" direction="in" type="s"/>
                <arg name="property_name" direction="in" type="s"/>
                <arg name="value" direction="in" type="v"/>
            </method>
            <method name="GetAll">
                <arg name="interface_name" direction="in" type="s"/>
                <arg name="props" direction="out" type="a{sv}"/>
            </method>
            <signal name="PropertiesChanged">
                <arg name="interface_name" type="s"/>
                <arg name="changed_properties" type="a{sv}"/>
                <arg name="invalidated_properties" type="as"/>
            </signal>
        </interface>
    </node>"#,
    )
    .unwrap_or_default()
}

fn escape(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

fn attribute(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    escape(out, value);
    out.push('"');
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("  ");
    }
}

fn write_node(out: &mut String, node: &Node, level: usize) {
    indent(out, level);
    out.push_str("<node");

    if let Some(name) = &node.name {
        attribute(out, "name", name);
    }

    if node.interfaces.is_empty() && node.nodes.is_empty() {
        out.push_str("/>\n");
        return;
    }

    out.push_str(">\n");

    for interface in &node.interfaces {
        write_interface(out, interface, level + 1);
    }

    for child in &node.nodes {
        write_node(out, child, level + 1);
    }

    indent(out, level);
    out.push_str("</node>\n");
}

fn write_interface(out: &mut String, interface: &Interface, level: usize) {
    indent(out, level);
    out.push_str("<interface");
    attribute(out, "name", &interface.name);
    out.push_str(">\n");

    for method in &interface.methods {
        indent(out, level + 1);
        out.push_str("<method");
        attribute(out, "name", &method.name);

        if method.in_args.is_empty() && method.out_args.is_empty() {
            out.push_str("/>\n");
        } else {
            out.push_str(">\n");

            for arg in method.in_args.iter().chain(&method.out_args) {
                write_arg(out, arg, level + 2);
            }

            indent(out, level + 1);
            out.push_str("</method>\n");
        }
    }

    for signal in &interface.signals {
        indent(out, level + 1);
        out.push_str("<signal");
        attribute(out, "name", &signal.name);

        if signal.args.is_empty() {
            out.push_str("/>\n");
        } else {
            out.push_str(">\n");

            for arg in &signal.args {
                write_arg(out, arg, level + 2);
            }

            indent(out, level + 1);
            out.push_str("</signal>\n");
        }
    }

    for property in &interface.properties {
        indent(out, level + 1);
        out.push_str("<property");
        attribute(out, "name", &property.name);
        attribute(out, "type", property.signature());
        attribute(out, "access", property.access.as_str());
        out.push_str("/>\n");
    }

    indent(out, level);
    out.push_str("</interface>\n");
}

fn write_arg(out: &mut String, arg: &Arg, level: usize) {
    indent(out, level);
    out.push_str("<arg");

    if let Some(name) = &arg.name {
        attribute(out, "name", name);
    }

    if let Some(direction) = arg.direction {
        attribute(out, "direction", direction.as_str());
    }

    attribute(out, "type", arg.signature());
    out.push_str("/>\n");
}

#[derive(Default)]
struct RawElement {
    name: Option<String>,
    ty: Option<String>,
    direction: Option<String>,
    access: Option<String>,
}

enum State {
    Node(Node),
    Interface(Interface),
    Method(Method),
    Signal(Signal),
    Property(RawElement),
    Arg(RawElement),
    // An unknown element or annotation whose subtree is skipped.
    Skip,
}

fn parse_document(data: &str) -> Result<Node> {
    let mut stack = Vec::new();
    let mut root = None;

    for token in xmlparser::Tokenizer::from(data) {
        let token = match token {
            Ok(token) => token,
            Err(error) => return Err(invalid(format!("malformed document: {error}"))),
        };

        match token {
            Token::ElementStart { local, .. } => {
                let state = match (stack.last(), local.as_str()) {
                    (None | Some(State::Node(..)), "node") => State::Node(Node::new(None)),
                    (Some(State::Node(..)), "interface") => {
                        State::Interface(Interface {
                            name: String::new(),
                            methods: Vec::new(),
                            signals: Vec::new(),
                            properties: Vec::new(),
                        })
                    }
                    (Some(State::Interface(..)), "method") => State::Method(Method {
                        name: String::new(),
                        in_args: Vec::new(),
                        out_args: Vec::new(),
                    }),
                    (Some(State::Interface(..)), "signal") => State::Signal(Signal {
                        name: String::new(),
                        args: Vec::new(),
                    }),
                    (Some(State::Interface(..)), "property") => {
                        State::Property(RawElement::default())
                    }
                    (Some(State::Method(..) | State::Signal(..)), "arg") => {
                        State::Arg(RawElement::default())
                    }
                    _ => State::Skip,
                };

                stack.push(state);
            }
            Token::Attribute { local, value, .. } => {
                let Some(state) = stack.last_mut() else {
                    continue;
                };

                match state {
                    State::Node(node) => {
                        if local.as_str() == "name" {
                            node.name = Some(value.as_str().to_owned());
                        }
                    }
                    State::Interface(interface) => {
                        if local.as_str() == "name" {
                            interface.name = value.as_str().to_owned();
                        }
                    }
                    State::Method(method) => {
                        if local.as_str() == "name" {
                            method.name = value.as_str().to_owned();
                        }
                    }
                    State::Signal(signal) => {
                        if local.as_str() == "name" {
                            signal.name = value.as_str().to_owned();
                        }
                    }
                    State::Property(raw) | State::Arg(raw) => match local.as_str() {
                        "name" => raw.name = Some(value.as_str().to_owned()),
                        "type" => raw.ty = Some(value.as_str().to_owned()),
                        "direction" => raw.direction = Some(value.as_str().to_owned()),
                        "access" => raw.access = Some(value.as_str().to_owned()),
                        _ => {}
                    },
                    State::Skip => {}
                }
            }
            Token::ElementEnd { end, .. } => match end {
                ElementEnd::Open => {}
                ElementEnd::Close(..) | ElementEnd::Empty => {
                    let Some(state) = stack.pop() else {
                        return Err(invalid("unbalanced element end"));
                    };

                    if let Some(node) = fold(state, stack.last_mut())? {
                        root = Some(node);
                    }
                }
            },
            _ => {}
        }
    }

    match root {
        Some(root) => Ok(root),
        None => Err(invalid(
            "introspection data must have a `node` for the root element",
        )),
    }
}

/// Fold a completed element into its parent, returning the root node when the
/// outermost element closes.
fn fold(state: State, parent: Option<&mut State>) -> Result<Option<Node>> {
    match (state, parent) {
        (State::Node(node), None) => Ok(Some(node)),
        (State::Node(node), Some(State::Node(parent))) => {
            if node.name.is_none() {
                return Err(invalid("child nodes must have a `name` attribute"));
            }

            parent.nodes.push(node);
            Ok(None)
        }
        (State::Interface(interface), Some(State::Node(parent))) => {
            validators::assert_interface_name_valid(&interface.name)
                .map_err(|_| invalid("interfaces must have a valid `name` attribute"))?;

            parent.interfaces.push(interface);
            Ok(None)
        }
        (State::Method(method), Some(State::Interface(parent))) => {
            validators::assert_member_name_valid(&method.name)
                .map_err(|_| invalid("methods must have a valid `name` attribute"))?;

            parent.methods.push(method);
            Ok(None)
        }
        (State::Signal(signal), Some(State::Interface(parent))) => {
            validators::assert_member_name_valid(&signal.name)
                .map_err(|_| invalid("signals must have a valid `name` attribute"))?;

            parent.signals.push(signal);
            Ok(None)
        }
        (State::Property(raw), Some(State::Interface(parent))) => {
            let Some(name) = raw.name else {
                return Err(invalid("properties must have a `name` attribute"));
            };

            let Some(ty) = raw.ty else {
                return Err(invalid("properties must have a `type` attribute"));
            };

            let access = match raw.access {
                Some(access) => PropertyAccess::from_str(&access)?,
                None => PropertyAccess::ReadWrite,
            };

            parent.properties.push(Property::new(&name, &ty, access)?);
            Ok(None)
        }
        (State::Arg(raw), Some(State::Method(parent))) => {
            let Some(ty) = raw.ty else {
                return Err(invalid("a method argument must have a `type` attribute"));
            };

            let direction = match raw.direction.as_deref() {
                Some("out") => ArgDirection::Out,
                _ => ArgDirection::In,
            };

            let arg = Arg::new(&ty, Some(direction), raw.name.as_deref())?;

            match direction {
                ArgDirection::In => parent.in_args.push(arg),
                ArgDirection::Out => parent.out_args.push(arg),
            }

            Ok(None)
        }
        (State::Arg(raw), Some(State::Signal(parent))) => {
            let Some(ty) = raw.ty else {
                return Err(invalid("a signal argument must have a `type` attribute"));
            };

            let arg = Arg::new(&ty, Some(ArgDirection::Out), raw.name.as_deref())?;
            parent.args.push(arg);
            Ok(None)
        }
        (State::Skip, ..) => Ok(None),
        _ => Err(invalid("element in an unexpected position")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        <!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
        <node>
          <interface name="se.tedro.Example">
            <method name="Echo">
              <arg name="what" direction="in" type="s"/>
              <arg direction="out" type="s"/>
            </method>
            <method name="Nothing"/>
            <signal name="ValueChanged">
              <arg name="value" type="u"/>
            </signal>
            <property name="StringProp" type="s" access="readwrite"/>
            <property name="Hidden" type="a{sv}" access="read"/>
            <annotation name="org.freedesktop.DBus.Deprecated" value="true"/>
          </interface>
          <node name="child"/>
        </node>
    "#;

    #[test]
    fn test_parse() {
        let node = Node::parse(EXAMPLE).unwrap();

        assert_eq!(node.name, None);
        assert_eq!(node.interfaces.len(), 1);
        assert_eq!(node.nodes.len(), 1);
        assert_eq!(node.nodes[0].name.as_deref(), Some("child"));

        let interface = &node.interfaces[0];
        assert_eq!(interface.name, "se.tedro.Example");
        assert_eq!(interface.methods.len(), 2);
        assert_eq!(interface.signals.len(), 1);
        assert_eq!(interface.properties.len(), 2);

        let echo = &interface.methods[0];
        assert_eq!(echo.in_signature(), "s");
        assert_eq!(echo.out_signature(), "s");
        assert_eq!(echo.in_args[0].name.as_deref(), Some("what"));

        assert_eq!(interface.signals[0].signature(), "u");

        assert_eq!(interface.properties[0].signature(), "s");
        assert_eq!(interface.properties[0].access, PropertyAccess::ReadWrite);
        assert_eq!(interface.properties[1].access, PropertyAccess::Read);
    }

    #[test]
    fn test_round_trip() {
        let node = Node::parse(EXAMPLE).unwrap();
        let serialized = node.to_xml();
        assert!(serialized.starts_with("<!DOCTYPE node"));

        let reparsed = Node::parse(&serialized).unwrap();
        assert_eq!(reparsed, node);
    }

    #[test]
    fn test_invalid_documents() {
        assert!(Node::parse("").is_err());
        assert!(Node::parse("<interface name=\"a.b\"/>").is_err());
        assert!(Node::parse("<node><node/></node>").is_err());
        assert!(Node::parse("<node><interface name=\"nodots\"/></node>").is_err());

        let missing_type = r#"<node><interface name="a.b"><property name="P" access="read"/></interface></node>"#;
        assert!(Node::parse(missing_type).is_err());
    }

    #[test]
    fn test_default_root() {
        let node = Node::default_root(None);

        let names = node
            .interfaces
            .iter()
            .map(|i| i.name.as_str())
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            [
                "org.freedesktop.DBus.Introspectable",
                "org.freedesktop.DBus.Peer",
                "org.freedesktop.DBus.Properties",
            ]
        );
    }

    #[test]
    fn test_unknown_elements_skipped() {
        let node = Node::parse(
            r#"<node>
                <interface name="a.b">
                    <method name="M">
                        <unknown><nested/></unknown>
                    </method>
                </interface>
            </node>"#,
        )
        .unwrap();

        assert_eq!(node.interfaces[0].methods.len(), 1);
    }
}
