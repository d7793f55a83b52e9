//! Path table and inbound dispatch.
//!
//! A [`Service`] owns the objects exported on one connection, answers the
//! standard interfaces (introspection, properties, peer, object manager and
//! the `SetMulti` convenience member) for every path, and routes all other
//! calls to the object implementing the requested interface.

use crate::object::{Object, ObjectBuilder};
use async_trait::async_trait;
use buslink_types::error::names;
use buslink_types::introspect::{ArgInfo, Direction, InterfaceInfo, MethodInfo, Node, SignalInfo};
use buslink_types::standard::*;
use buslink_types::{Args, BusError, BusResult, BusType, Message, ObjectPath, Value, Variant};
use buslink_wire::{Connection, MethodDispatcher};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info, warn};

type ManagedObjects = BTreeMap<ObjectPath, BTreeMap<String, BTreeMap<String, Value>>>;

/// Objects exported on one connection.
pub struct Service {
    conn: Arc<Connection>,
    objects: RwLock<BTreeMap<ObjectPath, Vec<Arc<Object>>>>,
    managers: RwLock<BTreeSet<ObjectPath>>,
}

impl Service {
    /// Create the service and install it as the connection's call receiver.
    pub fn new(conn: Arc<Connection>) -> Arc<Self> {
        let service = Arc::new(Self {
            conn,
            objects: RwLock::new(BTreeMap::new()),
            managers: RwLock::new(BTreeSet::new()),
        });
        let dispatcher: Weak<dyn MethodDispatcher> = Arc::downgrade(&service) as Weak<dyn MethodDispatcher>;
        service.conn.set_dispatcher(dispatcher);
        service
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Start declaring an object named the way this connection's config says.
    pub fn builder(&self, interface: &str) -> ObjectBuilder {
        ObjectBuilder::for_connection(interface, &self.conn)
    }

    /// Export `object` at `path`. One object per interface per path.
    pub fn export(&self, path: ObjectPath, object: Object) -> BusResult<Arc<Object>> {
        if is_standard(object.interface()) {
            return Err(BusError::Config(format!(
                "{} is served by the service itself",
                object.interface()
            )));
        }
        let object = Arc::new(object);
        {
            let mut table = self.objects.write().unwrap_or_else(|e| e.into_inner());
            let slot = table.entry(path.clone()).or_default();
            if slot.iter().any(|o| o.interface() == object.interface()) {
                return Err(BusError::Config(format!(
                    "{} already exported at {path}",
                    object.interface()
                )));
            }
            object.bind(&self.conn, path.clone());
            slot.push(Arc::clone(&object));
        }
        info!(path = %path, interface = %object.interface(), "Object exported");

        if let Some(manager) = self.manager_for(&path) {
            let props = object.get_all().unwrap_or_default();
            let added: BTreeMap<String, BTreeMap<String, Value>> =
                BTreeMap::from([(object.interface().to_string(), props)]);
            self.announce(manager, INTERFACES_ADDED, (path, added).into_values());
        }
        Ok(object)
    }

    /// Withdraw the object implementing `interface` at `path`.
    pub fn unexport(&self, path: &ObjectPath, interface: &str) -> Option<Arc<Object>> {
        let removed = {
            let mut table = self.objects.write().unwrap_or_else(|e| e.into_inner());
            let slot = table.get_mut(path)?;
            let pos = slot.iter().position(|o| o.interface() == interface)?;
            let removed = slot.remove(pos);
            if slot.is_empty() {
                table.remove(path);
            }
            removed
        };
        removed.unbind();
        info!(path = %path, interface, "Object withdrawn");

        if let Some(manager) = self.manager_for(path) {
            let body = (path.clone(), vec![interface.to_string()]).into_values();
            self.announce(manager, INTERFACES_REMOVED, body);
        }
        Some(removed)
    }

    /// The object implementing `interface` at `path`.
    pub fn object(&self, path: &ObjectPath, interface: &str) -> Option<Arc<Object>> {
        self.objects_at(path)
            .into_iter()
            .find(|o| o.interface() == interface)
    }

    /// Serve `GetManagedObjects` at `path` for everything below it.
    pub fn add_manager(&self, path: ObjectPath) {
        debug!(path = %path, "Object manager added");
        self.managers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
    }

    fn is_manager(&self, path: &ObjectPath) -> bool {
        self.managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    /// Nearest manager strictly above `path`.
    fn manager_for(&self, path: &ObjectPath) -> Option<ObjectPath> {
        let managers = self.managers.read().unwrap_or_else(|e| e.into_inner());
        managers
            .iter()
            .filter(|m| m.child_segment_towards(path).is_some())
            .max_by_key(|m| m.as_str().len())
            .cloned()
    }

    fn announce(&self, manager: ObjectPath, member: &'static str, body: Vec<Value>) {
        let conn = Arc::clone(&self.conn);
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = conn.emit(manager, OBJECT_MANAGER, member, body).await {
                    warn!(error = %e, member, "Object manager signal failed");
                }
            });
        }
    }

    fn objects_at(&self, path: &ObjectPath) -> Vec<Arc<Object>> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Direct child node names of `path`, including intermediate nodes.
    pub fn children(&self, path: &ObjectPath) -> Vec<String> {
        let table = self.objects.read().unwrap_or_else(|e| e.into_inner());
        table
            .keys()
            .filter_map(|p| path.child_segment_towards(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Introspection data for `path`.
    pub fn introspect(&self, path: &ObjectPath) -> BusResult<Node> {
        let objects = self.objects_at(path);
        let children = self.children(path);
        let manager = self.is_manager(path);
        if objects.is_empty() && children.is_empty() && !manager && path != &ObjectPath::root() {
            return Err(unknown_object(path));
        }
        let mut interfaces = vec![introspectable_info(), peer_info()];
        if !objects.is_empty() {
            interfaces.push(properties_info());
        }
        if objects.iter().any(|o| o.accepts_set_multi()) {
            interfaces.push(set_multi_info());
        }
        if manager {
            interfaces.push(object_manager_info());
        }
        interfaces.extend(objects.iter().map(|o| o.info()));
        Ok(Node {
            interfaces,
            children,
        })
    }

    async fn handle(&self, call: &Message) -> BusResult<Option<Vec<Value>>> {
        let path = call
            .path
            .clone()
            .ok_or_else(|| BusError::remote(names::UNKNOWN_OBJECT, "call without a path"))?;
        let member = call.member();
        let objects = self.objects_at(&path);

        match call.interface.as_deref() {
            Some(INTROSPECTABLE) => self.handle_introspectable(&path, member),
            Some(PEER) => handle_peer(member),
            Some(PROPERTIES) => self.handle_properties(&path, &objects, call).await,
            Some(OBJECT_MANAGER) => self.handle_object_manager(&path, member),
            Some(SET_MULTI_INTERFACE) => handle_set_multi(&path, &objects, call).await,
            Some(interface) => {
                let object = objects
                    .iter()
                    .find(|o| o.interface() == interface)
                    .ok_or_else(|| self.unknown_interface(&path, interface))?;
                run(object, call).await
            }
            None => {
                if member == INTROSPECT {
                    return self.handle_introspectable(&path, member);
                }
                if member == PING {
                    return handle_peer(member);
                }
                let object = objects
                    .iter()
                    .find(|o| o.method(member).is_some())
                    .ok_or_else(|| {
                        BusError::remote(
                            names::UNKNOWN_METHOD,
                            format!("no method '{member}' at {path}"),
                        )
                    })?;
                run(object, call).await
            }
        }
    }

    fn unknown_interface(&self, path: &ObjectPath, interface: &str) -> BusError {
        if self.objects_at(path).is_empty() && self.children(path).is_empty() {
            unknown_object(path)
        } else {
            BusError::remote(
                names::UNKNOWN_INTERFACE,
                format!("no interface '{interface}' at {path}"),
            )
        }
    }

    fn handle_introspectable(&self, path: &ObjectPath, member: &str) -> BusResult<Option<Vec<Value>>> {
        match member {
            INTROSPECT => {
                let node = self.introspect(path)?;
                Ok(Some(vec![Value::Str(node.to_xml()?)]))
            }
            other => Err(unknown_method(INTROSPECTABLE, other)),
        }
    }

    async fn handle_properties(
        &self,
        path: &ObjectPath,
        objects: &[Arc<Object>],
        call: &Message,
    ) -> BusResult<Option<Vec<Value>>> {
        let find = |interface: &str| {
            objects
                .iter()
                .find(|o| o.interface() == interface)
                .ok_or_else(|| self.unknown_interface(path, interface))
        };
        match call.member() {
            GET => {
                let (interface, name) = <(String, String)>::from_values(call.body.clone())?;
                let value = find(&interface)?.get(&name)?;
                Ok(Some(vec![Variant::new(value).into()]))
            }
            GET_ALL => {
                let (interface,) = <(String,)>::from_values(call.body.clone())?;
                let all = find(&interface)?.get_all()?;
                Ok(Some(vec![all.into_value()]))
            }
            SET => {
                let (interface, name, value) =
                    <(String, String, Value)>::from_values(call.body.clone())?;
                find(&interface)?.set(&name, value).await?;
                Ok(Some(Vec::new()))
            }
            other => Err(unknown_method(PROPERTIES, other)),
        }
    }

    fn handle_object_manager(&self, path: &ObjectPath, member: &str) -> BusResult<Option<Vec<Value>>> {
        if !self.is_manager(path) {
            return Err(self.unknown_interface(path, OBJECT_MANAGER));
        }
        if member != GET_MANAGED_OBJECTS {
            return Err(unknown_method(OBJECT_MANAGER, member));
        }
        let table = self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut managed = ManagedObjects::new();
        for (child, objects) in table {
            if path.child_segment_towards(&child).is_none() {
                continue;
            }
            let mut interfaces = BTreeMap::new();
            for object in objects {
                interfaces.insert(object.interface().to_string(), object.get_all()?);
            }
            managed.insert(child, interfaces);
        }
        Ok(Some(vec![managed.into_value()]))
    }
}

async fn run(object: &Arc<Object>, call: &Message) -> BusResult<Option<Vec<Value>>> {
    let member = call.member();
    let no_reply = object.method(member).is_some_and(|m| m.flags().no_reply);
    let result = object.call(member, call.body.clone()).await;
    if no_reply {
        if let Err(e) = result {
            warn!(member, error = %e, "No-reply method failed");
        }
        return Ok(None);
    }
    result.map(Some)
}

fn handle_peer(member: &str) -> BusResult<Option<Vec<Value>>> {
    match member {
        PING => Ok(Some(Vec::new())),
        other => Err(unknown_method(PEER, other)),
    }
}

async fn handle_set_multi(
    path: &ObjectPath,
    objects: &[Arc<Object>],
    call: &Message,
) -> BusResult<Option<Vec<Value>>> {
    if call.member() != SET_MULTI {
        return Err(unknown_method(SET_MULTI_INTERFACE, call.member()));
    }
    let (interface, values) =
        <(String, BTreeMap<String, Value>)>::from_values(call.body.clone())?;
    let object = objects
        .iter()
        .find(|o| o.interface() == interface && o.accepts_set_multi())
        .ok_or_else(|| {
            BusError::remote(
                names::UNKNOWN_INTERFACE,
                format!("{interface} at {path} does not accept SetMulti"),
            )
        })?;
    object.set_many(values.into_iter().collect()).await?;
    Ok(Some(Vec::new()))
}

fn unknown_object(path: &ObjectPath) -> BusError {
    BusError::remote(names::UNKNOWN_OBJECT, format!("no object at {path}"))
}

fn unknown_method(interface: &str, member: &str) -> BusError {
    BusError::remote(
        names::UNKNOWN_METHOD,
        format!("no method '{member}' on {interface}"),
    )
}

fn is_standard(interface: &str) -> bool {
    matches!(
        interface,
        INTROSPECTABLE | PROPERTIES | PEER | OBJECT_MANAGER | SET_MULTI_INTERFACE
    )
}

#[async_trait]
impl MethodDispatcher for Service {
    async fn dispatch(&self, _conn: &Arc<Connection>, call: &Message) -> Option<Message> {
        debug!(
            path = ?call.path.as_ref().map(ObjectPath::as_str),
            interface = call.interface(),
            member = call.member(),
            serial = call.serial,
            "Method call"
        );
        match self.handle(call).await {
            Ok(Some(body)) => Some(Message::method_return(call, body)),
            Ok(None) => None,
            Err(e) => {
                debug!(member = call.member(), error = %e, "Method call failed");
                Some(Message::error_from(call, &e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Standard interface descriptions
// ---------------------------------------------------------------------------

fn arg(name: &str, signature: &str, direction: Direction) -> ArgInfo {
    ArgInfo {
        name: Some(name.to_string()),
        signature: signature.to_string(),
        direction,
    }
}

fn method(name: &str, args: Vec<ArgInfo>) -> MethodInfo {
    MethodInfo {
        name: name.to_string(),
        args,
        deprecated: false,
        no_reply: false,
    }
}

fn introspectable_info() -> InterfaceInfo {
    let mut info = InterfaceInfo::new(INTROSPECTABLE);
    info.methods
        .push(method(INTROSPECT, vec![arg("data", "s", Direction::Out)]));
    info
}

fn peer_info() -> InterfaceInfo {
    let mut info = InterfaceInfo::new(PEER);
    info.methods.push(method(PING, Vec::new()));
    info
}

fn properties_info() -> InterfaceInfo {
    use Direction::{In, Out};
    let mut info = InterfaceInfo::new(PROPERTIES);
    info.methods.push(method(
        GET,
        vec![arg("interface", "s", In), arg("name", "s", In), arg("value", "v", Out)],
    ));
    info.methods.push(method(
        GET_ALL,
        vec![arg("interface", "s", In), arg("properties", "a{sv}", Out)],
    ));
    info.methods.push(method(
        SET,
        vec![arg("interface", "s", In), arg("name", "s", In), arg("value", "v", In)],
    ));
    info.signals.push(SignalInfo {
        name: PROPERTIES_CHANGED.to_string(),
        args: vec![
            arg("interface", "s", In),
            arg("changed", "a{sv}", In),
            arg("invalidated", "as", In),
        ],
        deprecated: false,
    });
    info
}

fn object_manager_info() -> InterfaceInfo {
    use Direction::{In, Out};
    let mut info = InterfaceInfo::new(OBJECT_MANAGER);
    info.methods.push(method(
        GET_MANAGED_OBJECTS,
        vec![arg("objects", "a{oa{sa{sv}}}", Out)],
    ));
    info.signals.push(SignalInfo {
        name: INTERFACES_ADDED.to_string(),
        args: vec![arg("path", "o", In), arg("interfaces", "a{sa{sv}}", In)],
        deprecated: false,
    });
    info.signals.push(SignalInfo {
        name: INTERFACES_REMOVED.to_string(),
        args: vec![arg("path", "o", In), arg("interfaces", "as", In)],
        deprecated: false,
    });
    info
}

fn set_multi_info() -> InterfaceInfo {
    let mut info = InterfaceInfo::new(SET_MULTI_INTERFACE);
    info.methods.push(method(
        SET_MULTI,
        vec![
            arg("interface", "s", Direction::In),
            arg("values", "a{sv}", Direction::In),
        ],
    ));
    info
}
