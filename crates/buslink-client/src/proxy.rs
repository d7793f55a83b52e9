//! Introspection-driven proxies.
//!
//! A [`Proxy`] starts empty. [`Proxy::update`] fetches the remote node's
//! introspection data and builds one [`ProxyInterface`] per interface, each
//! with signature-aware method handles, a seeded [`PropertyCache`] and
//! signal handles. Until then every accessor fails with `NotReady`.
//!
//! Member lookup takes the bus name (`GetAll`) or, when the connection's
//! config has `camel_convert` on, its snake_case form (`get_all`).

use crate::cache::PropertyCache;
use crate::call::RemoteObject;
use buslink_types::introspect::{InterfaceInfo, MethodInfo, Node, PropertyInfo, SignalInfo};
use buslink_types::names::camel_to_snake;
use buslink_types::standard::{INTROSPECT, INTROSPECTABLE};
use buslink_types::value::coerce_values;
use buslink_types::{
    Args, BusError, BusResult, BusType, Message, ObjectPath, Signature, SignatureSpec, Value,
};
use buslink_wire::{dynamic_handler, typed_handler, Connection, ListenerGuard, MatchRule};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

fn matches_name(external: &str, wanted: &str, camel: bool) -> bool {
    external == wanted || (camel && camel_to_snake(external) == wanted)
}

fn not_found(kind: &str, name: &str, interface: &str) -> BusError {
    BusError::NotFound(format!("no {kind} '{name}' on {interface}"))
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

struct Ready {
    node: Node,
    interfaces: BTreeMap<String, Arc<ProxyInterface>>,
}

/// Client-side stand-in for one remote node.
pub struct Proxy {
    conn: Arc<Connection>,
    destination: String,
    path: ObjectPath,
    default_interface: String,
    state: RwLock<Option<Arc<Ready>>>,
}

impl Proxy {
    /// A proxy for `path` on `destination`. Without an explicit interface,
    /// the destination name doubles as the default interface.
    pub fn new(
        conn: Arc<Connection>,
        destination: &str,
        path: ObjectPath,
        interface: Option<&str>,
    ) -> Self {
        Self {
            conn,
            destination: destination.to_string(),
            path,
            default_interface: interface.unwrap_or(destination).to_string(),
            state: RwLock::new(None),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn default_interface(&self) -> &str {
        &self.default_interface
    }

    pub fn is_ready(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn ready(&self) -> BusResult<Arc<Ready>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                BusError::NotReady(format!("proxy for {} not introspected", self.path))
            })
    }

    fn remote(&self, interface: &str) -> RemoteObject {
        RemoteObject::new(
            Arc::clone(&self.conn),
            &self.destination,
            self.path.clone(),
            interface,
        )
    }

    /// Introspect the remote node and rebuild every interface.
    ///
    /// Handles taken from a previous build keep working against their own
    /// caches and listeners but are no longer reachable from this proxy.
    pub async fn update(&self) -> BusResult<()> {
        let body = self
            .remote(INTROSPECTABLE)
            .call_values(INTROSPECT, Vec::new(), &SignatureSpec::Exact(Signature::new("s")?))
            .await?;
        let data = body.first().and_then(Value::as_str).ok_or_else(|| {
            BusError::TypeMismatch("introspection reply is not a string".into())
        })?;
        let node = Node::from_xml(data)?;

        let mut interfaces = BTreeMap::new();
        for info in &node.interfaces {
            let iface = ProxyInterface::build(self.remote(&info.name), info.clone()).await?;
            interfaces.insert(info.name.clone(), Arc::new(iface));
        }
        info!(
            destination = %self.destination,
            path = %self.path,
            interfaces = interfaces.len(),
            children = node.children.len(),
            "Proxy ready"
        );
        *self.state.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(Ready { node, interfaces }));
        Ok(())
    }

    /// The introspection data of the last update.
    pub fn node(&self) -> BusResult<Node> {
        Ok(self.ready()?.node.clone())
    }

    pub fn interface_names(&self) -> BusResult<Vec<String>> {
        Ok(self.ready()?.interfaces.keys().cloned().collect())
    }

    /// An interface by name, or the default interface.
    pub fn interface(&self, name: Option<&str>) -> BusResult<Arc<ProxyInterface>> {
        let name = name.unwrap_or(&self.default_interface);
        self.ready()?
            .interfaces
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::NotFound(format!("no interface '{name}' at {}", self.path)))
    }

    pub fn children(&self) -> BusResult<Vec<String>> {
        Ok(self.ready()?.node.children.clone())
    }

    /// A ready proxy for the child node `name`.
    pub async fn child(&self, name: &str) -> BusResult<Proxy> {
        let ready = self.ready()?;
        if !ready.node.children.iter().any(|c| c == name) {
            return Err(BusError::NotFound(format!("no child '{name}' at {}", self.path)));
        }
        let child = Proxy {
            conn: Arc::clone(&self.conn),
            destination: self.destination.clone(),
            path: self.path.join(name)?,
            default_interface: self.default_interface.clone(),
            state: RwLock::new(None),
        };
        child.update().await?;
        Ok(child)
    }

    pub fn method(&self, name: &str) -> BusResult<ProxyMethod> {
        self.interface(None)?.method(name)
    }

    pub fn property(&self, name: &str) -> BusResult<ProxyProperty> {
        self.interface(None)?.property(name)
    }

    pub fn signal(&self, name: &str) -> BusResult<ProxySignal> {
        self.interface(None)?.signal(name)
    }

    /// Call a method on the default interface.
    pub async fn call<A: Args, R: Args>(&self, member: &str, args: A) -> BusResult<R> {
        self.method(member)?.call(args).await
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("destination", &self.destination)
            .field("path", &self.path)
            .field("ready", &self.is_ready())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Interfaces and members
// ---------------------------------------------------------------------------

/// One remote interface as described by introspection.
pub struct ProxyInterface {
    info: InterfaceInfo,
    remote: RemoteObject,
    cache: Arc<PropertyCache>,
}

impl ProxyInterface {
    async fn build(remote: RemoteObject, info: InterfaceInfo) -> BusResult<Self> {
        let cache = PropertyCache::new(remote.clone());
        if !info.properties.is_empty() {
            for prop in &info.properties {
                cache.set_mode(&prop.name, prop.emits_changed);
            }
            cache.attach().await?;
            cache.refresh().await?;
        }
        debug!(interface = %info.name, "Interface proxied");
        Ok(Self {
            info,
            remote,
            cache,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    pub fn cache(&self) -> &Arc<PropertyCache> {
        &self.cache
    }

    pub fn remote(&self) -> &RemoteObject {
        &self.remote
    }

    fn camel_convert(&self) -> bool {
        self.remote.connection().config().camel_convert
    }

    pub fn method(&self, name: &str) -> BusResult<ProxyMethod> {
        let info = self
            .info
            .methods
            .iter()
            .find(|m| matches_name(&m.name, name, self.camel_convert()))
            .ok_or_else(|| not_found("method", name, &self.info.name))?;
        ProxyMethod::new(self.remote.clone(), info.clone())
    }

    pub fn property(&self, name: &str) -> BusResult<ProxyProperty> {
        let info = self
            .info
            .properties
            .iter()
            .find(|p| matches_name(&p.name, name, self.camel_convert()))
            .ok_or_else(|| not_found("property", name, &self.info.name))?;
        Ok(ProxyProperty {
            info: info.clone(),
            cache: Arc::clone(&self.cache),
        })
    }

    pub fn signal(&self, name: &str) -> BusResult<ProxySignal> {
        let info = self
            .info
            .signals
            .iter()
            .find(|s| matches_name(&s.name, name, self.camel_convert()))
            .ok_or_else(|| not_found("signal", name, &self.info.name))?;
        ProxySignal::new(self.remote.clone(), info.clone())
    }

    pub async fn call<A: Args, R: Args>(&self, member: &str, args: A) -> BusResult<R> {
        self.method(member)?.call(args).await
    }
}

/// A remote method with its introspected signatures.
#[derive(Debug, Clone)]
pub struct ProxyMethod {
    remote: RemoteObject,
    info: MethodInfo,
    in_signature: Signature,
    out_signature: Signature,
}

impl ProxyMethod {
    fn new(remote: RemoteObject, info: MethodInfo) -> BusResult<Self> {
        Ok(Self {
            in_signature: info.in_signature()?,
            out_signature: info.out_signature()?,
            remote,
            info,
        })
    }

    pub fn info(&self) -> &MethodInfo {
        &self.info
    }

    pub fn in_signature(&self) -> &Signature {
        &self.in_signature
    }

    pub fn out_signature(&self) -> &Signature {
        &self.out_signature
    }

    /// This method with a different reply deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            remote: self.remote.with_timeout(timeout),
            ..self.clone()
        }
    }

    /// Call with raw values. Arguments are checked against the introspected
    /// input signature before anything is sent.
    pub async fn call_values(&self, args: Vec<Value>) -> BusResult<Vec<Value>> {
        let args = coerce_values(args, &self.in_signature)?;
        if self.info.no_reply {
            self.remote.notify(&self.info.name, args).await?;
            return Ok(Vec::new());
        }
        let expected = SignatureSpec::Exact(self.out_signature.clone());
        self.remote.call_values(&self.info.name, args, &expected).await
    }

    /// Call with typed arguments and decode a typed reply.
    pub async fn call<A: Args, R: Args>(&self, args: A) -> BusResult<R> {
        let body = self.call_values(args.into_values()).await?;
        R::from_values(coerce_values(body, &R::signature())?)
    }
}

/// A remote property read through the interface's cache.
#[derive(Clone)]
pub struct ProxyProperty {
    info: PropertyInfo,
    cache: Arc<PropertyCache>,
}

impl ProxyProperty {
    pub fn info(&self) -> &PropertyInfo {
        &self.info
    }

    pub async fn get(&self) -> BusResult<Value> {
        if !self.info.access.readable() {
            return Err(BusError::Permission(format!(
                "property '{}' is write-only",
                self.info.name
            )));
        }
        self.cache.get(&self.info.name).await
    }

    pub async fn get_as<T: BusType>(&self) -> BusResult<T> {
        let value = self.get().await?;
        T::from_value(value.coerce(&T::signature())?)
    }

    /// Remote write, checked locally against the declared signature and
    /// access first.
    pub async fn set(&self, value: impl Into<Value>) -> BusResult<()> {
        if !self.info.access.writable() {
            return Err(BusError::Permission(format!(
                "property '{}' is read-only",
                self.info.name
            )));
        }
        let signature = Signature::new(self.info.signature.as_str())?;
        let value = value.into().unboxed().coerce(&signature)?;
        self.cache.set(&self.info.name, value).await
    }
}

/// A remote signal; connecting returns a guard that unsubscribes on drop.
#[derive(Debug, Clone)]
pub struct ProxySignal {
    remote: RemoteObject,
    info: SignalInfo,
    signature: Signature,
    args: Vec<String>,
}

impl ProxySignal {
    fn new(remote: RemoteObject, info: SignalInfo) -> BusResult<Self> {
        Ok(Self {
            signature: info.signature()?,
            remote,
            info,
            args: Vec::new(),
        })
    }

    pub fn info(&self) -> &SignalInfo {
        &self.info
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Only deliver signals whose next leading argument equals `value`.
    pub fn filter(mut self, value: &str) -> Self {
        self.args.push(value.to_string());
        self
    }

    fn rule(&self) -> MatchRule {
        let mut rule = MatchRule::signal()
            .sender(self.remote.destination())
            .path(self.remote.path().clone())
            .interface(self.remote.interface())
            .member(self.info.name.as_str());
        for arg in &self.args {
            rule = rule.arg(arg.as_str());
        }
        rule
    }

    /// Subscribe a typed handler. Its argument tuple must accept the
    /// introspected signature, otherwise nothing is registered.
    pub async fn connect<A, F, Fut>(&self, f: F) -> BusResult<ListenerGuard>
    where
        A: Args + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let conn = self.remote.connection();
        let declared = SignatureSpec::Exact(self.signature.clone());
        let handle = conn
            .add_listener(self.rule(), typed_handler(f), Some(declared))
            .await?;
        Ok(ListenerGuard::new(conn, handle))
    }

    /// Subscribe a handler receiving the whole message, whatever its payload.
    pub async fn connect_any<F, Fut>(&self, f: F) -> BusResult<ListenerGuard>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let conn = self.remote.connection();
        let handle = conn
            .add_listener(self.rule(), dynamic_handler(f), Some(SignatureSpec::Any))
            .await?;
        Ok(ListenerGuard::new(conn, handle))
    }
}
