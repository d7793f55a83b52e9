//! Bus message envelope.
//!
//! Byte-level framing belongs to the transport. A [`Message`] is the decoded
//! form every component here produces and consumes: one of four kinds, header
//! fields, and a body of [`Value`]s whose concatenated signatures form the
//! message signature.

use crate::error::{BusError, BusResult};
use crate::path::ObjectPath;
use crate::signature::Signature;
use crate::value::{signature_of, Value};
use std::fmt;

/// The four message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    /// Name used in match rules (`type='signal'`).
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::MethodCall => "method_call",
            MessageKind::MethodReturn => "method_return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "method_call" => Some(MessageKind::MethodCall),
            "method_return" => Some(MessageKind::MethodReturn),
            "error" => Some(MessageKind::Error),
            "signal" => Some(MessageKind::Signal),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    /// Assigned by the sending connection; 0 until then.
    pub serial: u32,
    /// Serial of the call this message answers (returns and errors).
    pub reply_serial: Option<u32>,
    /// Unique name of the sender; stamped by the bus.
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    /// Error name for [`MessageKind::Error`].
    pub error_name: Option<String>,
    /// The caller does not want a reply.
    pub no_reply_expected: bool,
    pub body: Vec<Value>,
}

impl Message {
    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            no_reply_expected: false,
            body: Vec::new(),
        }
    }

    /// A method call.
    pub fn method_call(
        destination: Option<&str>,
        path: ObjectPath,
        interface: Option<&str>,
        member: &str,
        body: Vec<Value>,
    ) -> Self {
        Self {
            destination: destination.map(str::to_string),
            path: Some(path),
            interface: interface.map(str::to_string),
            member: Some(member.to_string()),
            body,
            ..Self::empty(MessageKind::MethodCall)
        }
    }

    /// A successful reply to `call`.
    pub fn method_return(call: &Message, body: Vec<Value>) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            body,
            ..Self::empty(MessageKind::MethodReturn)
        }
    }

    /// An error reply to `call`. The body carries the message text.
    pub fn error(call: &Message, name: &str, message: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(name.to_string()),
            body: vec![Value::Str(message.to_string())],
            ..Self::empty(MessageKind::Error)
        }
    }

    /// An error reply built from a [`BusError`].
    pub fn error_from(call: &Message, err: &BusError) -> Self {
        Self::error(call, err.error_name(), &err.reply_message())
    }

    /// A broadcast signal.
    pub fn signal(path: ObjectPath, interface: &str, member: &str, body: Vec<Value>) -> Self {
        Self {
            path: Some(path),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            body,
            ..Self::empty(MessageKind::Signal)
        }
    }

    /// Mark a call as not expecting a reply.
    pub fn with_no_reply(mut self) -> Self {
        self.no_reply_expected = true;
        self
    }

    /// Signature of the body.
    pub fn signature(&self) -> Signature {
        signature_of(&self.body)
    }

    pub fn member(&self) -> &str {
        self.member.as_deref().unwrap_or_default()
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or_default()
    }

    /// String argument at `index`, for match-rule filters.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.body.get(index).and_then(Value::as_str)
    }

    /// Turn a reply into its body, or into [`BusError::Remote`] for errors.
    pub fn into_result(self) -> BusResult<Vec<Value>> {
        match self.kind {
            MessageKind::Error => {
                let name = self
                    .error_name
                    .clone()
                    .unwrap_or_else(|| crate::error::names::FAILED.to_string());
                let message = self.arg_str(0).unwrap_or_default().to_string();
                Err(BusError::remote(name, message))
            }
            _ => Ok(self.body),
        }
    }
}
