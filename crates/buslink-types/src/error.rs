//! Shared error types for buslink.

use std::time::Duration;
use thiserror::Error;

/// Well-known protocol error names used in error replies.
pub mod names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
}

/// Top-level error type for buslink.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// A value or type has no wire representation, or does not fit the
    /// signature it was checked against.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// A declared signature disagrees with the inferred one.
    #[error("Signature mismatch: expected '{expected}', got '{actual}'")]
    SignatureMismatch {
        /// The signature that was required.
        expected: String,
        /// The signature that was found.
        actual: String,
    },

    /// Write to a read-only or constant property.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The remote peer answered with an error reply.
    #[error("{name}: {message}")]
    Remote {
        /// Protocol error name, e.g. `org.freedesktop.DBus.Error.Failed`.
        name: String,
        /// Human-readable message carried by the reply.
        message: String,
    },

    /// No reply arrived before the deadline.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// A proxy was used before introspection completed.
    #[error("Proxy not ready: {0}")]
    NotReady(String),

    /// Unknown member, node, property or interface.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The transport refused the message or the connection is gone.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Build a remote error from an error name and message.
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Protocol error name used when this error is sent as an error reply.
    pub fn error_name(&self) -> &str {
        match self {
            BusError::TypeMismatch(_) => names::INVALID_ARGS,
            BusError::SignatureMismatch { .. } => names::INVALID_ARGS,
            BusError::Permission(_) => names::PROPERTY_READ_ONLY,
            BusError::Remote { name, .. } => name,
            BusError::Timeout(_) => names::NO_REPLY,
            BusError::NotReady(_) => names::FAILED,
            BusError::NotFound(_) => names::UNKNOWN_METHOD,
            BusError::Transport(_) => names::FAILED,
            BusError::Config(_) => names::FAILED,
        }
    }

    /// Message text used when this error is sent as an error reply.
    pub fn reply_message(&self) -> String {
        match self {
            BusError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Alias for buslink results.
pub type BusResult<T> = Result<T, BusError>;
