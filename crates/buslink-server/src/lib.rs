//! buslink server side: exporting objects on a connection.
//!
//! An [`Object`] is one interface: methods, properties and signals built with
//! [`ObjectBuilder`]. A [`Service`] holds the path table for a connection and
//! answers the standard interfaces on every path, so exported objects only
//! deal with their own members.

pub mod method;
pub mod object;
pub mod property;
pub mod service;
pub mod signal;

pub use method::{Method, MethodFlags};
pub use object::{Object, ObjectBuilder, UpdateBatch};
pub use property::Property;
pub use service::Service;
pub use signal::Signal;
