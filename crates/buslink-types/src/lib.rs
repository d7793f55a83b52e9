//! Core types for buslink.
//!
//! This crate defines the wire value model, the signature engine that maps
//! Rust types to wire signatures, message envelopes, introspection metadata,
//! configuration and the shared error type. It performs no IO.

pub mod config;
pub mod convert;
pub mod error;
pub mod introspect;
pub mod message;
pub mod names;
pub mod path;
pub mod signature;
pub mod standard;
pub mod value;

pub use config::{load_config, BusConfig, BusKind};
pub use convert::{Args, BasicType, BusType};
pub use error::{BusError, BusResult};
pub use message::{Message, MessageKind};
pub use path::ObjectPath;
pub use signature::{Signature, SignatureSpec};
pub use value::{Array, Dict, Value, Variant};
