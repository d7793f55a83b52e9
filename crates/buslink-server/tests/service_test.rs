//! Integration tests for exported objects, driven over an in-process bus.

use buslink_server::{Method, Object, ObjectBuilder, Property, Service, Signal};
use buslink_types::error::names;
use buslink_types::introspect::{Access, ChangeMode, Node};
use buslink_types::standard::*;
use buslink_types::{Args, BusConfig, BusError, BusType, Message, ObjectPath, Value, Variant};
use buslink_wire::{dynamic_handler, Connection, MatchRule, MemoryBus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

const NAME: &str = "com.example.Calc";
const TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn path(p: &str) -> ObjectPath {
    ObjectPath::new(p).unwrap()
}

// ---------------------------------------------------------------------------
// Fixture: a calculator object and a plain client connection
// ---------------------------------------------------------------------------

fn calculator() -> Object {
    ObjectBuilder::new(NAME)
        .method(
            Method::new("add", |(a, b): (i32, i32)| async move { Ok((a + b,)) })
                .arg_names(&["a", "b"])
                .result_names(&["sum"]),
        )
        .method(Method::new("secret", |(): ()| async move { Ok(()) }).hidden())
        .property(Property::new("count", 0i32))
        .property(Property::new("label", "calc".to_string()).read_only())
        .property(Property::new("cache_size", 8u32).change_mode(ChangeMode::Invalidates))
        .signal(Signal::new::<(u32,)>("overflow").arg_names(&["value"]))
        .build()
        .unwrap()
}

struct Harness {
    _bus: MemoryBus,
    service: Arc<Service>,
    client: Arc<Connection>,
}

async fn harness() -> Harness {
    init_tracing();
    let bus = MemoryBus::new();
    let conn = assert_ok!(bus.connect(BusConfig::named(NAME)).await);
    let service = Service::new(conn);
    let client = assert_ok!(bus.connect(BusConfig::default()).await);
    Harness {
        _bus: bus,
        service,
        client,
    }
}

impl Harness {
    async fn call(&self, p: &str, iface: &str, member: &str, body: Vec<Value>) -> Result<Vec<Value>, BusError> {
        let msg = Message::method_call(Some(NAME), path(p), Some(iface), member, body);
        self.client.call(msg, TIMEOUT).await
    }

    /// Collect every signal with `member` into a channel.
    async fn watch(&self, member: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rule = MatchRule::signal().sender(NAME).member(member);
        self.client
            .add_listener(
                rule,
                dynamic_handler(move |msg: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(msg);
                    }
                }),
                None,
            )
            .await
            .unwrap();
        rx
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("signal not delivered")
        .expect("channel closed")
}

fn s(v: &str) -> Value {
    Value::Str(v.to_string())
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_introspection_describes_exported_members() {
    let h = harness().await;
    h.service.export(path("/calc/main"), calculator()).unwrap();

    let body = h.call("/calc/main", INTROSPECTABLE, INTROSPECT, vec![]).await.unwrap();
    let xml = body[0].as_str().unwrap();
    assert!(xml.starts_with("<!DOCTYPE node"));
    assert!(xml.contains(r#"<interface name="com.example.Calc">"#));
    assert!(xml.contains(r#"<arg name="a" type="i" direction="in"/>"#));
    assert!(xml.contains(r#"<annotation name="org.freedesktop.DBus.Property.EmitsChangedSignal" value="invalidates"/>"#));
    let node = Node::from_xml(xml).unwrap();
    let calc = node.interface(NAME).unwrap();

    let add = calc.methods.iter().find(|m| m.name == "Add").unwrap();
    assert_eq!(add.in_signature().unwrap().as_str(), "ii");
    assert_eq!(add.out_signature().unwrap().as_str(), "i");
    assert!(calc.methods.iter().all(|m| m.name != "Secret"));

    let label = calc.properties.iter().find(|p| p.name == "Label").unwrap();
    assert_eq!(label.access, Access::Read);
    assert_eq!(calc.signals[0].name, "Overflow");
    assert!(node.interface(PROPERTIES).is_some());
    assert!(node.interface(PEER).is_some());

    let body = h.call("/calc", INTROSPECTABLE, INTROSPECT, vec![]).await.unwrap();
    let parent = Node::from_xml(body[0].as_str().unwrap()).unwrap();
    assert_eq!(parent.children, vec!["main"]);
    assert!(parent.interface(NAME).is_none());
}

#[tokio::test]
async fn test_connection_config_controls_member_names() {
    init_tracing();
    let bus = MemoryBus::new();
    let config = BusConfig {
        camel_convert: false,
        ..BusConfig::named(NAME)
    };
    let service = Service::new(assert_ok!(bus.connect(config).await));
    let client = assert_ok!(bus.connect(BusConfig::default()).await);
    let object = service
        .builder(NAME)
        .method(Method::new("add", |(a, b): (i32, i32)| async move { Ok((a + b,)) }))
        .property(Property::new("count", 3i32))
        .build()
        .unwrap();
    service.export(path("/calc"), object).unwrap();

    let call = |member: &str, iface: &str, body: Vec<Value>| {
        Message::method_call(Some(NAME), path("/calc"), Some(iface), member, body)
    };
    let body = client
        .call(call("add", NAME, vec![Value::Int32(1), Value::Int32(2)]), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(body, vec![Value::Int32(3)]);

    let err = client
        .call(call("Add", NAME, vec![Value::Int32(1), Value::Int32(2)]), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Remote { ref name, .. } if name == names::UNKNOWN_METHOD));

    let body = client
        .call(call(GET, PROPERTIES, vec![s(NAME), s("count")]), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(body, vec![Value::Variant(Box::new(Value::Int32(3)))]);
}

#[tokio::test]
async fn test_hidden_method_is_still_callable() {
    let h = harness().await;
    h.service.export(path("/calc"), calculator()).unwrap();
    assert_ok!(h.call("/calc", NAME, "Secret", vec![]).await);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_get_set_get_all_over_the_bus() {
    let h = harness().await;
    h.service.export(path("/calc"), calculator()).unwrap();

    h.call(
        "/calc",
        PROPERTIES,
        SET,
        vec![s(NAME), s("Count"), Variant::new(42i32).into()],
    )
    .await
    .unwrap();

    let body = h.call("/calc", PROPERTIES, GET, vec![s(NAME), s("Count")]).await.unwrap();
    assert_eq!(body, vec![Value::Variant(Box::new(Value::Int32(42)))]);

    let body = h.call("/calc", PROPERTIES, GET_ALL, vec![s(NAME)]).await.unwrap();
    let all = BTreeMap::<String, Value>::from_value(body[0].clone()).unwrap();
    assert_eq!(all["Count"], Value::Int32(42));
    assert_eq!(all["Label"], s("calc"));
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_property_errors_carry_protocol_names() {
    let h = harness().await;
    h.service.export(path("/calc"), calculator()).unwrap();

    let err = h
        .call("/calc", PROPERTIES, SET, vec![s(NAME), s("Label"), Variant::new("x").into()])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Remote { ref name, .. } if name == names::PROPERTY_READ_ONLY));

    let err = h
        .call("/calc", PROPERTIES, GET, vec![s(NAME), s("Missing")])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Remote { ref name, .. } if name == names::UNKNOWN_PROPERTY));

    let err = h
        .call("/calc", PROPERTIES, SET, vec![s(NAME), s("Count"), Variant::new("x").into()])
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Remote { ref name, .. } if name == names::INVALID_ARGS));
}

#[tokio::test]
async fn test_batch_emits_one_notification_with_final_values() {
    let h = harness().await;
    let calc = h.service.export(path("/calc"), calculator()).unwrap();
    let mut rx = h.watch(PROPERTIES_CHANGED).await;

    let batch = calc.begin_update();
    for n in 1..=3i32 {
        calc.update("Count", n).await.unwrap();
    }
    calc.update("CacheSize", 16u32).await.unwrap();
    batch.end().await.unwrap();

    let msg = next(&mut rx).await;
    let (iface, changed, invalidated) =
        <(String, BTreeMap<String, Value>, Vec<String>)>::from_values(msg.body).unwrap();
    assert_eq!(iface, NAME);
    assert_eq!(changed.len(), 1);
    assert_eq!(changed["Count"], Value::Int32(3));
    assert_eq!(invalidated, vec!["CacheSize"]);

    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "batch produced more than one notification");
}

#[tokio::test]
async fn test_unchanged_value_is_not_announced() {
    let h = harness().await;
    let calc = h.service.export(path("/calc"), calculator()).unwrap();
    let mut rx = h.watch(PROPERTIES_CHANGED).await;

    calc.update("Count", 0i32).await.unwrap();
    calc.update("Count", 5i32).await.unwrap();
    let msg = next(&mut rx).await;
    let changed = BTreeMap::<String, Value>::from_value(msg.body[1].clone()).unwrap();
    assert_eq!(changed["Count"], Value::Int32(5));
}

#[tokio::test]
async fn test_set_multi_is_all_or_nothing() {
    let h = harness().await;
    let calc = h.service.export(path("/calc"), calculator()).unwrap();

    let good = BTreeMap::from([("Count".to_string(), Value::Int32(9))]);
    h.call("/calc", SET_MULTI_INTERFACE, SET_MULTI, vec![s(NAME), good.into_value()])
        .await
        .unwrap();
    assert_eq!(calc.get("Count").unwrap(), Value::Int32(9));

    let bad = BTreeMap::from([
        ("Count".to_string(), Value::Int32(1)),
        ("Label".to_string(), s("nope")),
    ]);
    let err = h
        .call("/calc", SET_MULTI_INTERFACE, SET_MULTI, vec![s(NAME), bad.into_value()])
        .await;
    assert!(err.is_err());
    assert_eq!(calc.get("Count").unwrap(), Value::Int32(9));
}

// ---------------------------------------------------------------------------
// Methods and signals
// ---------------------------------------------------------------------------

type Probe = futures::future::BoxFuture<'static, Result<(), BusError>>;

/// Handler that records how many copies of itself run at once.
fn overlap_probe(
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
) -> impl Fn(()) -> Probe + Send + Sync + 'static {
    move |(): ()| -> Probe {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        Box::pin(async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_not_thread_safe_handlers_are_serialized() {
    let h = harness().await;
    let active = Arc::new(AtomicUsize::new(0));
    let serial_peak = Arc::new(AtomicUsize::new(0));
    let free_peak = Arc::new(AtomicUsize::new(0));
    let object = ObjectBuilder::new(NAME)
        .method(
            Method::new("Locked", overlap_probe(Arc::clone(&active), Arc::clone(&serial_peak)))
                .not_thread_safe(),
        )
        .method(Method::new(
            "Free",
            overlap_probe(Arc::clone(&active), Arc::clone(&free_peak)),
        ))
        .build()
        .unwrap();
    h.service.export(path("/probe"), object).unwrap();

    let locked = (0..3).map(|_| h.call("/probe", NAME, "Locked", vec![]));
    for r in futures::future::join_all(locked).await {
        assert_ok!(r);
    }
    assert_eq!(serial_peak.load(Ordering::SeqCst), 1);

    let free = (0..3).map(|_| h.call("/probe", NAME, "Free", vec![]));
    for r in futures::future::join_all(free).await {
        assert_ok!(r);
    }
    assert!(free_peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_no_reply_method_runs_without_answer() {
    let h = harness().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let object = ObjectBuilder::new(NAME)
        .method(
            Method::new("poke", move |(): ()| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .no_reply(),
        )
        .build()
        .unwrap();
    h.service.export(path("/poke"), object).unwrap();

    let msg = Message::method_call(Some(NAME), path("/poke"), Some(NAME), "Poke", vec![]).with_no_reply();
    assert_eq!(h.client.call(msg, TIMEOUT).await.unwrap(), Vec::<Value>::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(h.client.pending().is_empty());
}

#[tokio::test]
async fn test_declared_signal_reaches_subscriber() {
    let h = harness().await;
    let calc = h.service.export(path("/calc"), calculator()).unwrap();
    let mut rx = h.watch("Overflow").await;

    calc.emit("Overflow", (7u32,)).await.unwrap();
    let msg = next(&mut rx).await;
    assert_eq!(msg.path, Some(path("/calc")));
    assert_eq!(msg.body, vec![Value::Uint32(7)]);

    assert!(calc.emit("Underflow", (1u32,)).await.is_err());
}

// ---------------------------------------------------------------------------
// Object manager
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_object_manager_lists_and_announces() {
    let h = harness().await;
    h.service.add_manager(path("/things"));
    let mut added = h.watch(INTERFACES_ADDED).await;
    let mut removed = h.watch(INTERFACES_REMOVED).await;

    h.service.export(path("/things/one"), calculator()).unwrap();
    let msg = next(&mut added).await;
    assert_eq!(msg.path, Some(path("/things")));
    assert_eq!(msg.body[0], Value::ObjectPath(path("/things/one")));

    let body = h.call("/things", OBJECT_MANAGER, GET_MANAGED_OBJECTS, vec![]).await.unwrap();
    let managed =
        BTreeMap::<ObjectPath, BTreeMap<String, BTreeMap<String, Value>>>::from_value(body[0].clone())
            .unwrap();
    assert_eq!(managed[&path("/things/one")][NAME]["Count"], Value::Int32(0));

    assert!(h.service.unexport(&path("/things/one"), NAME).is_some());
    let msg = next(&mut removed).await;
    assert_eq!(msg.body[1], vec![NAME.to_string()].into_value());
}
