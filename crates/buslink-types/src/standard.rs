//! Well-known names of the standard interfaces and the bus itself.

/// Bus daemon name, path and interface.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Introspection: `Introspect() -> s`.
pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
pub const INTROSPECT: &str = "Introspect";

/// Property management: `Get`, `GetAll`, `Set`, `PropertiesChanged`.
pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
pub const GET: &str = "Get";
pub const GET_ALL: &str = "GetAll";
pub const SET: &str = "Set";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// Liveness: `Ping()`.
pub const PEER: &str = "org.freedesktop.DBus.Peer";
pub const PING: &str = "Ping";

/// Object manager: `GetManagedObjects() -> a{oa{sa{sv}}}`.
pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
pub const GET_MANAGED_OBJECTS: &str = "GetManagedObjects";
pub const INTERFACES_ADDED: &str = "InterfacesAdded";
pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";

/// Convenience interface: `SetMulti(s interface, a{sv} properties)`.
pub const SET_MULTI_INTERFACE: &str = "buslink.Properties";
pub const SET_MULTI: &str = "SetMulti";
