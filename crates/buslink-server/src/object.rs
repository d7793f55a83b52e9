//! Exported objects.
//!
//! An [`Object`] is one interface implemented at one path: a dispatch table
//! of methods, the property table with its change notifier, and the signals
//! it may emit. It is built once by [`ObjectBuilder`] and never changes shape
//! afterwards; only property values move.
//!
//! Property changes are announced with one `PropertiesChanged` signal per
//! mutation, or, inside an [`UpdateBatch`], with one signal for the whole
//! batch carrying each touched property's final value.

use crate::method::Method;
use crate::property::Property;
use crate::signal::Signal;
use buslink_types::error::names;
use buslink_types::introspect::{ChangeMode, InterfaceInfo};
use buslink_types::names::snake_to_camel;
use buslink_types::standard::{PROPERTIES, PROPERTIES_CHANGED};
use buslink_types::value::coerce_values;
use buslink_types::{Args, BusError, BusResult, ObjectPath, Value};
use buslink_wire::Connection;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, warn};

/// Declares the members of an [`Object`].
pub struct ObjectBuilder {
    interface: String,
    methods: Vec<Method>,
    properties: Vec<Property>,
    signals: Vec<Signal>,
    deprecated: bool,
    set_multi: bool,
    camel_convert: Option<bool>,
}

impl ObjectBuilder {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
            deprecated: false,
            set_multi: true,
            camel_convert: None,
        }
    }

    /// A builder taking its naming defaults from `conn`'s config.
    pub fn for_connection(interface: &str, conn: &Connection) -> Self {
        Self {
            camel_convert: Some(conn.config().camel_convert),
            ..Self::new(interface)
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    /// Do not answer the multi-property `SetMulti` convenience member.
    pub fn without_set_multi(mut self) -> Self {
        self.set_multi = false;
        self
    }

    /// Derive external names from snake_case (`set_level` → `SetLevel`).
    /// Overrides the connection's config; on when neither says otherwise.
    /// Names already in CamelCase pass through unchanged.
    pub fn camel_convert(mut self, on: bool) -> Self {
        self.camel_convert = Some(on);
        self
    }

    /// Freeze the member tables.
    pub fn build(self) -> BusResult<Object> {
        let camel = self.camel_convert.unwrap_or(true);
        let convert = move |name: &str| {
            if camel {
                snake_to_camel(name)
            } else {
                name.to_string()
            }
        };

        let mut methods = self.methods;
        let mut method_index = HashMap::new();
        for (i, m) in methods.iter_mut().enumerate() {
            m.rename(convert(m.name()));
            if method_index.insert(m.name().to_string(), i).is_some() {
                return Err(duplicate(&self.interface, "method", m.name()));
            }
        }

        let mut properties = self.properties;
        let mut property_index = HashMap::new();
        for (i, p) in properties.iter_mut().enumerate() {
            p.rename(convert(p.name()));
            if property_index.insert(p.name().to_string(), i).is_some() {
                return Err(duplicate(&self.interface, "property", p.name()));
            }
        }

        let mut signals = self.signals;
        let mut signal_index = HashMap::new();
        for (i, s) in signals.iter_mut().enumerate() {
            s.rename(convert(s.name()));
            if signal_index.insert(s.name().to_string(), i).is_some() {
                return Err(duplicate(&self.interface, "signal", s.name()));
            }
        }

        for m in &methods {
            m.in_signature().check_len()?;
            m.out_signature().check_len()?;
        }
        for p in &properties {
            p.signature().check_len()?;
        }
        for s in &signals {
            s.signature().check_len()?;
        }

        Ok(Object {
            interface: self.interface,
            methods,
            method_index,
            properties,
            property_index,
            signals,
            signal_index,
            deprecated: self.deprecated,
            set_multi: self.set_multi,
            exclusive: tokio::sync::Mutex::new(()),
            binding: RwLock::new(None),
            batch: Mutex::new(Batch::default()),
        })
    }
}

fn duplicate(interface: &str, kind: &str, name: &str) -> BusError {
    BusError::Config(format!("duplicate {kind} '{name}' on {interface}"))
}

struct Binding {
    conn: Weak<Connection>,
    path: ObjectPath,
}

#[derive(Default)]
struct Batch {
    depth: usize,
    changed: Vec<String>,
}

/// One interface exported at one path.
pub struct Object {
    interface: String,
    methods: Vec<Method>,
    method_index: HashMap<String, usize>,
    properties: Vec<Property>,
    property_index: HashMap<String, usize>,
    signals: Vec<Signal>,
    signal_index: HashMap<String, usize>,
    deprecated: bool,
    set_multi: bool,
    /// Held by every handler not marked thread-safe.
    exclusive: tokio::sync::Mutex<()>,
    binding: RwLock<Option<Binding>>,
    batch: Mutex<Batch>,
}

impl Object {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn accepts_set_multi(&self) -> bool {
        self.set_multi
    }

    pub(crate) fn bind(&self, conn: &Arc<Connection>, path: ObjectPath) {
        *self.binding.write().unwrap_or_else(|e| e.into_inner()) = Some(Binding {
            conn: Arc::downgrade(conn),
            path,
        });
    }

    pub(crate) fn unbind(&self) {
        *self.binding.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Path this object is exported at.
    pub fn path(&self) -> Option<ObjectPath> {
        self.binding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|b| b.path.clone())
    }

    fn bound(&self) -> Option<(Arc<Connection>, ObjectPath)> {
        let binding = self.binding.read().unwrap_or_else(|e| e.into_inner());
        let b = binding.as_ref()?;
        Some((b.conn.upgrade()?, b.path.clone()))
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.method_index.get(name).map(|&i| &self.methods[i])
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.property_index.get(name).map(|&i| &self.properties[i])
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signal_index.get(name).map(|&i| &self.signals[i])
    }

    fn require_property(&self, name: &str) -> BusResult<&Property> {
        self.property(name).ok_or_else(|| {
            BusError::remote(
                names::UNKNOWN_PROPERTY,
                format!("no property '{name}' on {}", self.interface),
            )
        })
    }

    /// Introspection data; hidden members are left out.
    pub fn info(&self) -> InterfaceInfo {
        InterfaceInfo {
            name: self.interface.clone(),
            methods: self
                .methods
                .iter()
                .filter(|m| !m.flags().hidden)
                .map(Method::info)
                .collect(),
            properties: self
                .properties
                .iter()
                .filter(|p| !p.is_hidden())
                .map(Property::info)
                .collect(),
            signals: self
                .signals
                .iter()
                .filter(|s| !s.is_hidden())
                .map(Signal::info)
                .collect(),
            deprecated: self.deprecated,
        }
    }

    /// Run a method by external name.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> BusResult<Vec<Value>> {
        let method = self.method(member).ok_or_else(|| {
            BusError::remote(
                names::UNKNOWN_METHOD,
                format!("no method '{member}' on {}", self.interface),
            )
        })?;
        if method.flags().thread_safe {
            method.invoke(args).await
        } else {
            let _guard = self.exclusive.lock().await;
            method.invoke(args).await
        }
    }

    /// Read a property.
    pub fn get(&self, name: &str) -> BusResult<Value> {
        let prop = self.require_property(name)?;
        if !prop.access().readable() {
            return Err(BusError::remote(
                names::ACCESS_DENIED,
                format!("property '{name}' is write-only"),
            ));
        }
        prop.read()
    }

    /// All readable, visible properties.
    pub fn get_all(&self) -> BusResult<BTreeMap<String, Value>> {
        self.properties
            .iter()
            .filter(|p| p.access().readable() && !p.is_hidden())
            .map(|p| -> BusResult<(String, Value)> { Ok((p.name().to_string(), p.read()?)) })
            .collect()
    }

    /// Remote write: honours access mode and constness.
    pub async fn set(&self, name: &str, value: Value) -> BusResult<()> {
        let value = self.require_property(name)?.check_remote_write(value)?;
        self.commit(name, value).await
    }

    /// Owner-side write: ignores the access mode, refuses constants.
    pub async fn update(&self, name: &str, value: impl Into<Value>) -> BusResult<()> {
        let value = self.require_property(name)?.check_update(value.into())?;
        self.commit(name, value).await
    }

    /// Remote write of several properties at once. Every value is checked
    /// before any is stored; one notification covers them all.
    pub async fn set_many(&self, values: Vec<(String, Value)>) -> BusResult<()> {
        let checked = values
            .into_iter()
            .map(|(name, value)| -> BusResult<(String, Value)> {
                let value = self.require_property(&name)?.check_remote_write(value)?;
                Ok((name, value))
            })
            .collect::<BusResult<Vec<_>>>()?;
        self.enter_batch();
        for (name, value) in checked {
            if let Some(prop) = self.property(&name) {
                if prop.store(value) {
                    self.record(&name);
                }
            }
        }
        self.leave_batch().await
    }

    async fn commit(&self, name: &str, value: Value) -> BusResult<()> {
        let Some(prop) = self.property(name) else {
            return Ok(());
        };
        if !prop.store(value) {
            return Ok(());
        }
        if self.record(name) {
            return Ok(());
        }
        self.emit_changes(vec![name.to_string()]).await
    }

    /// Start deferring change notifications. Batches nest; the outermost
    /// one flushes.
    pub fn begin_update(self: &Arc<Self>) -> UpdateBatch {
        self.enter_batch();
        UpdateBatch {
            object: Arc::clone(self),
            open: true,
        }
    }

    fn enter_batch(&self) {
        self.batch.lock().unwrap_or_else(|e| e.into_inner()).depth += 1;
    }

    /// Queue a change if a batch is open.
    fn record(&self, name: &str) -> bool {
        let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        if batch.depth == 0 {
            return false;
        }
        if !batch.changed.iter().any(|n| n == name) {
            batch.changed.push(name.to_string());
        }
        true
    }

    /// Close one batch level; the names to flush when it was the last.
    fn exit_batch(&self) -> Vec<String> {
        let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        batch.depth = batch.depth.saturating_sub(1);
        if batch.depth == 0 {
            std::mem::take(&mut batch.changed)
        } else {
            Vec::new()
        }
    }

    async fn leave_batch(&self) -> BusResult<()> {
        let names = self.exit_batch();
        if names.is_empty() {
            return Ok(());
        }
        self.emit_changes(names).await
    }

    /// Announce changed properties in one `PropertiesChanged` signal.
    async fn emit_changes(&self, names: Vec<String>) -> BusResult<()> {
        let mut changed = BTreeMap::new();
        let mut invalidated = Vec::new();
        for name in names {
            let Some(prop) = self.property(&name) else {
                continue;
            };
            match prop.mode() {
                ChangeMode::Emits => {
                    changed.insert(name, prop.read()?);
                }
                ChangeMode::Invalidates => invalidated.push(name),
                ChangeMode::Const | ChangeMode::None => {}
            }
        }
        if changed.is_empty() && invalidated.is_empty() {
            return Ok(());
        }
        let Some((conn, path)) = self.bound() else {
            debug!(interface = %self.interface, "Object not exported, change not announced");
            return Ok(());
        };
        debug!(
            path = %path,
            interface = %self.interface,
            changed = changed.len(),
            invalidated = invalidated.len(),
            "Properties changed"
        );
        let body = (self.interface.clone(), changed, invalidated).into_values();
        conn.emit(path, PROPERTIES, PROPERTIES_CHANGED, body).await
    }

    /// Emit one of this object's declared signals.
    pub async fn emit<A: Args>(&self, member: &str, args: A) -> BusResult<()> {
        self.emit_values(member, args.into_values()).await
    }

    pub async fn emit_values(&self, member: &str, args: Vec<Value>) -> BusResult<()> {
        let signal = self.signal(member).ok_or_else(|| {
            BusError::NotFound(format!("no signal '{member}' on {}", self.interface))
        })?;
        let body = coerce_values(args, signal.signature())?;
        let (conn, path) = self
            .bound()
            .ok_or_else(|| BusError::Transport(format!("{} is not exported", self.interface)))?;
        conn.emit(path, &self.interface, member, body).await
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("interface", &self.interface)
            .field("methods", &self.methods.len())
            .field("properties", &self.properties.len())
            .field("signals", &self.signals.len())
            .finish()
    }
}

/// Open deferred-notification scope. Call [`UpdateBatch::end`] to flush and
/// observe emission errors; dropping it flushes in the background.
pub struct UpdateBatch {
    object: Arc<Object>,
    open: bool,
}

impl UpdateBatch {
    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    pub async fn end(mut self) -> BusResult<()> {
        self.open = false;
        self.object.leave_batch().await
    }
}

impl Drop for UpdateBatch {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let names = self.object.exit_batch();
        if names.is_empty() {
            return;
        }
        let object = Arc::clone(&self.object);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = object.emit_changes(names).await {
                        warn!(error = %e, "Deferred property notification failed");
                    }
                });
            }
            Err(_) => warn!(
                interface = %object.interface,
                "Update batch dropped outside a runtime, changes not announced"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buslink_types::introspect::Access;

    fn counter() -> Object {
        ObjectBuilder::new("com.example.Counter")
            .property(Property::new("count", 0i32))
            .property(Property::new("label", "a".to_string()).read_only())
            .property(Property::new("id", 7u32).change_mode(ChangeMode::Const))
            .method(
                Method::new("increment_by", |(n,): (i32,)| async move { Ok((n + 1,)) })
                    .not_thread_safe(),
            )
            .method(Method::new("secret", |(): ()| async { Ok(()) }).hidden())
            .signal(Signal::new::<(i32,)>("overflowed"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_names_converted() {
        let obj = counter();
        assert!(obj.property("Count").is_some());
        assert!(obj.method("IncrementBy").is_some());
        assert!(obj.signal("Overflowed").is_some());
        assert!(obj.method("increment_by").is_none());
    }

    #[test]
    fn test_over_long_signature_rejected_at_build() {
        type Row = (i32, i32, i32, i32, i32, i32, i32, i32);
        type Block = (Row, Row, Row, Row, Row, Row, Row, Row);
        let err = ObjectBuilder::new("com.example.Wide")
            .signal(Signal::new::<(Block, Block, Block, Block)>("flood"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BusError::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn test_builder_follows_connection_config() {
        let bus = buslink_wire::MemoryBus::new();
        let config = buslink_types::BusConfig {
            camel_convert: false,
            ..buslink_types::BusConfig::default()
        };
        let conn = bus.connect(config).await.unwrap();

        let plain = ObjectBuilder::for_connection("com.example.Counter", &conn)
            .property(Property::new("count", 0i32))
            .build()
            .unwrap();
        assert!(plain.property("count").is_some());
        assert!(plain.property("Count").is_none());

        let forced = ObjectBuilder::for_connection("com.example.Counter", &conn)
            .camel_convert(true)
            .property(Property::new("count", 0i32))
            .build()
            .unwrap();
        assert!(forced.property("Count").is_some());
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = ObjectBuilder::new("com.example.X")
            .property(Property::new("level", 0i32))
            .property(Property::new("Level", 1i32))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn test_info_skips_hidden() {
        let info = counter().info();
        assert_eq!(info.methods.len(), 1);
        assert_eq!(info.properties.len(), 3);
        let label = info.properties.iter().find(|p| p.name == "Label").unwrap();
        assert_eq!(label.access, Access::Read);
    }

    #[tokio::test]
    async fn test_dispatch_by_external_name() {
        let obj = counter();
        assert_eq!(
            obj.call("IncrementBy", vec![Value::Int32(1)]).await.unwrap(),
            vec![Value::Int32(2)]
        );
        assert!(obj.call("Secret", vec![]).await.is_ok());
        let err = obj.call("Nope", vec![]).await.unwrap_err();
        assert_eq!(err.error_name(), names::UNKNOWN_METHOD);
    }

    #[tokio::test]
    async fn test_set_rules() {
        let obj = counter();
        obj.set("Count", Value::Int32(42)).await.unwrap();
        assert_eq!(obj.get("Count").unwrap(), Value::Int32(42));

        let err = obj.set("Label", Value::Str("b".into())).await.unwrap_err();
        assert!(matches!(err, BusError::Permission(_)));
        obj.update("Label", "b").await.unwrap();
        assert_eq!(obj.get("Label").unwrap(), Value::Str("b".into()));

        assert!(matches!(
            obj.update("Id", 8u32).await,
            Err(BusError::Permission(_))
        ));
        let err = obj.get("Missing").unwrap_err();
        assert_eq!(err.error_name(), names::UNKNOWN_PROPERTY);
    }

    #[tokio::test]
    async fn test_set_many_is_all_or_nothing() {
        let obj = counter();
        let err = obj
            .set_many(vec![
                ("Count".into(), Value::Int32(5)),
                ("Label".into(), Value::Str("z".into())),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Permission(_)));
        assert_eq!(obj.get("Count").unwrap(), Value::Int32(0));
    }

    #[tokio::test]
    async fn test_batch_nesting() {
        let obj = Arc::new(counter());
        let outer = obj.begin_update();
        let inner = obj.begin_update();
        obj.update("Count", 1i32).await.unwrap();
        obj.update("Count", 2i32).await.unwrap();
        inner.end().await.unwrap();
        assert_eq!(obj.batch.lock().unwrap().changed, vec!["Count".to_string()]);
        outer.end().await.unwrap();
        assert!(obj.batch.lock().unwrap().changed.is_empty());
        assert_eq!(obj.batch.lock().unwrap().depth, 0);
    }
}
