//! buslink client side.
//!
//! - **RemoteObject**: typed and raw calls plus property access against one
//!   destination, path and interface
//! - **PropertyCache**: notification-driven property values with change
//!   subscriptions
//! - **Proxy**: interfaces rebuilt from introspection, with method, property
//!   and signal handles looked up by name

pub mod cache;
pub mod call;
pub mod proxy;

pub use cache::PropertyCache;
pub use call::RemoteObject;
pub use proxy::{Proxy, ProxyInterface, ProxyMethod, ProxyProperty, ProxySignal};
