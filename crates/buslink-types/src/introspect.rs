//! Introspection metadata.
//!
//! A [`Node`] describes everything a remote peer needs to rebuild an object
//! model: interfaces with their methods, properties and signals, plus the
//! names of child nodes. On the bus it travels as the standard introspection
//! XML document returned by `org.freedesktop.DBus.Introspectable.Introspect`.
//!
//! The XML side is a set of private serde structs mirroring the document
//! (`@`-prefixed fields are attributes); [`Node`] is the decoded model.

use crate::error::{BusError, BusResult};
use crate::signature::Signature;
use serde::{Deserialize, Serialize};

/// Document type line emitted ahead of every introspection document.
pub const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">";

/// Annotation names understood on both sides.
pub mod annotations {
    pub const DEPRECATED: &str = "org.freedesktop.DBus.Deprecated";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Method.NoReply";
    pub const EMITS_CHANGED_SIGNAL: &str = "org.freedesktop.DBus.Property.EmitsChangedSignal";
}

/// Direction of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    fn parse(s: &str) -> BusResult<Self> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(invalid(format!("unknown argument direction '{other}'"))),
        }
    }
}

/// One method or signal argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    /// Optional argument name.
    pub name: Option<String>,
    /// Signature fragment (one complete type).
    pub signature: String,
    /// Direction; always `in` for signals.
    pub direction: Direction,
}

/// An exported method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
    pub deprecated: bool,
    pub no_reply: bool,
}

impl MethodInfo {
    /// Concatenated signature of the `in` arguments.
    pub fn in_signature(&self) -> BusResult<Signature> {
        joined(&self.args, Direction::In)
    }

    /// Concatenated signature of the `out` arguments.
    pub fn out_signature(&self) -> BusResult<Signature> {
        joined(&self.args, Direction::Out)
    }
}

fn joined(args: &[ArgInfo], direction: Direction) -> BusResult<Signature> {
    Signature::new(
        args.iter()
            .filter(|a| a.direction == direction)
            .map(|a| a.signature.as_str())
            .collect::<String>(),
    )
}

/// Access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }

    fn parse(s: &str) -> BusResult<Self> {
        match s {
            "read" => Ok(Access::Read),
            "write" => Ok(Access::Write),
            "readwrite" => Ok(Access::ReadWrite),
            other => Err(invalid(format!("unknown property access '{other}'"))),
        }
    }
}

/// How a property announces changes (the `EmitsChangedSignal` annotation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeMode {
    /// Changes are sent with the new value.
    #[default]
    Emits,
    /// Changes are announced without the value.
    Invalidates,
    /// The value never changes after export.
    Const,
    /// Changes are never announced; readers poll.
    None,
}

impl ChangeMode {
    /// True when readers must fetch the live value instead of a cached one.
    pub fn polls(self) -> bool {
        matches!(self, ChangeMode::None | ChangeMode::Const)
    }

    /// Annotation value.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeMode::Emits => "true",
            ChangeMode::Invalidates => "invalidates",
            ChangeMode::Const => "const",
            ChangeMode::None => "false",
        }
    }

    fn parse(s: &str) -> BusResult<Self> {
        match s {
            "true" => Ok(ChangeMode::Emits),
            "invalidates" => Ok(ChangeMode::Invalidates),
            "const" => Ok(ChangeMode::Const),
            "false" => Ok(ChangeMode::None),
            other => Err(invalid(format!("unknown EmitsChangedSignal value '{other}'"))),
        }
    }
}

/// An exported property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub signature: String,
    pub access: Access,
    pub emits_changed: ChangeMode,
    pub deprecated: bool,
}

/// An exported signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
    pub deprecated: bool,
}

impl SignalInfo {
    pub fn signature(&self) -> BusResult<Signature> {
        joined(&self.args, Direction::In)
    }
}

/// One interface on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
    pub properties: Vec<PropertyInfo>,
    pub signals: Vec<SignalInfo>,
    pub deprecated: bool,
}

impl InterfaceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
            deprecated: false,
        }
    }
}

/// A node (object path) with its interfaces and child node names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub interfaces: Vec<InterfaceInfo>,
    pub children: Vec<String>,
}

impl Node {
    /// Find an interface by name.
    pub fn interface(&self, name: &str) -> Option<&InterfaceInfo> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Render the introspection document.
    pub fn to_xml(&self) -> BusResult<String> {
        let body = quick_xml::se::to_string(&XmlNode::from(self))
            .map_err(|e| BusError::TypeMismatch(format!("cannot render introspection data: {e}")))?;
        Ok(format!("{INTROSPECT_DOCTYPE}\n{body}"))
    }

    /// Parse an introspection document.
    pub fn from_xml(data: &str) -> BusResult<Self> {
        let raw: XmlNode = quick_xml::de::from_str(data).map_err(invalid)?;
        raw.try_into()
    }
}

fn invalid(reason: impl std::fmt::Display) -> BusError {
    BusError::TypeMismatch(format!("invalid introspection data: {reason}"))
}

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "node")]
struct XmlNode {
    #[serde(rename = "interface", default, skip_serializing_if = "Vec::is_empty")]
    interfaces: Vec<XmlInterface>,
    #[serde(rename = "node", default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<XmlChild>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlChild {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlInterface {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "method", default, skip_serializing_if = "Vec::is_empty")]
    methods: Vec<XmlMethod>,
    #[serde(rename = "signal", default, skip_serializing_if = "Vec::is_empty")]
    signals: Vec<XmlSignal>,
    #[serde(rename = "property", default, skip_serializing_if = "Vec::is_empty")]
    properties: Vec<XmlProperty>,
    #[serde(rename = "annotation", default, skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<XmlAnnotation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlMethod {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "arg", default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<XmlArg>,
    #[serde(rename = "annotation", default, skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<XmlAnnotation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlSignal {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "arg", default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<XmlArg>,
    #[serde(rename = "annotation", default, skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<XmlAnnotation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlProperty {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    signature: String,
    #[serde(rename = "@access")]
    access: String,
    #[serde(rename = "annotation", default, skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<XmlAnnotation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlArg {
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "@type")]
    signature: String,
    #[serde(rename = "@direction", default, skip_serializing_if = "Option::is_none")]
    direction: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlAnnotation {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value")]
    value: String,
}

impl XmlAnnotation {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

fn annotation<'a>(list: &'a [XmlAnnotation], name: &str) -> Option<&'a str> {
    list.iter()
        .find(|a| a.name == name)
        .map(|a| a.value.as_str())
}

fn flag(list: &[XmlAnnotation], name: &str) -> bool {
    annotation(list, name) == Some("true")
}

fn flags(deprecated: bool, no_reply: bool) -> Vec<XmlAnnotation> {
    let mut out = Vec::new();
    if deprecated {
        out.push(XmlAnnotation::new(annotations::DEPRECATED, "true"));
    }
    if no_reply {
        out.push(XmlAnnotation::new(annotations::NO_REPLY, "true"));
    }
    out
}

fn xml_args(args: &[ArgInfo], with_direction: bool) -> Vec<XmlArg> {
    args.iter()
        .map(|a| XmlArg {
            name: a.name.clone(),
            signature: a.signature.clone(),
            direction: with_direction.then(|| a.direction.as_str().to_string()),
        })
        .collect()
}

fn model_args(args: Vec<XmlArg>, default: Direction) -> BusResult<Vec<ArgInfo>> {
    args.into_iter()
        .map(|a| {
            Ok(ArgInfo {
                name: a.name,
                signature: a.signature,
                direction: match a.direction.as_deref() {
                    Some(d) => Direction::parse(d)?,
                    None => default,
                },
            })
        })
        .collect()
}

impl From<&Node> for XmlNode {
    fn from(node: &Node) -> Self {
        Self {
            interfaces: node
                .interfaces
                .iter()
                .map(|iface| XmlInterface {
                    name: iface.name.clone(),
                    methods: iface
                        .methods
                        .iter()
                        .map(|m| XmlMethod {
                            name: m.name.clone(),
                            args: xml_args(&m.args, true),
                            annotations: flags(m.deprecated, m.no_reply),
                        })
                        .collect(),
                    signals: iface
                        .signals
                        .iter()
                        .map(|s| XmlSignal {
                            name: s.name.clone(),
                            args: xml_args(&s.args, false),
                            annotations: flags(s.deprecated, false),
                        })
                        .collect(),
                    properties: iface
                        .properties
                        .iter()
                        .map(|p| {
                            let mut notes = flags(p.deprecated, false);
                            if p.emits_changed != ChangeMode::Emits {
                                notes.push(XmlAnnotation::new(
                                    annotations::EMITS_CHANGED_SIGNAL,
                                    p.emits_changed.as_str(),
                                ));
                            }
                            XmlProperty {
                                name: p.name.clone(),
                                signature: p.signature.clone(),
                                access: p.access.as_str().to_string(),
                                annotations: notes,
                            }
                        })
                        .collect(),
                    annotations: flags(iface.deprecated, false),
                })
                .collect(),
            children: node
                .children
                .iter()
                .map(|name| XmlChild { name: name.clone() })
                .collect(),
        }
    }
}

impl TryFrom<XmlNode> for Node {
    type Error = BusError;

    fn try_from(raw: XmlNode) -> BusResult<Self> {
        let mut interfaces = Vec::with_capacity(raw.interfaces.len());
        for iface in raw.interfaces {
            // An interface-level EmitsChangedSignal is the default for its
            // properties.
            let default_mode =
                match annotation(&iface.annotations, annotations::EMITS_CHANGED_SIGNAL) {
                    Some(v) => ChangeMode::parse(v)?,
                    None => ChangeMode::Emits,
                };
            let mut info = InterfaceInfo::new(iface.name);
            info.deprecated = flag(&iface.annotations, annotations::DEPRECATED);
            for m in iface.methods {
                info.methods.push(MethodInfo {
                    deprecated: flag(&m.annotations, annotations::DEPRECATED),
                    no_reply: flag(&m.annotations, annotations::NO_REPLY),
                    args: model_args(m.args, Direction::In)?,
                    name: m.name,
                });
            }
            for s in iface.signals {
                info.signals.push(SignalInfo {
                    deprecated: flag(&s.annotations, annotations::DEPRECATED),
                    args: model_args(s.args, Direction::In)?
                        .into_iter()
                        .map(|a| ArgInfo {
                            direction: Direction::In,
                            ..a
                        })
                        .collect(),
                    name: s.name,
                });
            }
            for p in iface.properties {
                let emits_changed =
                    match annotation(&p.annotations, annotations::EMITS_CHANGED_SIGNAL) {
                        Some(v) => ChangeMode::parse(v)?,
                        None => default_mode,
                    };
                info.properties.push(PropertyInfo {
                    deprecated: flag(&p.annotations, annotations::DEPRECATED),
                    access: Access::parse(&p.access)?,
                    emits_changed,
                    signature: p.signature,
                    name: p.name,
                });
            }
            interfaces.push(info);
        }
        Ok(Node {
            interfaces,
            children: raw.children.into_iter().map(|c| c.name).collect(),
        })
    }
}
