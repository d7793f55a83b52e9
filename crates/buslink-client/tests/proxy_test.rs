//! Integration tests for proxies and the property cache against a real
//! exported service on an in-process bus.

use buslink_client::{PropertyCache, Proxy, RemoteObject};
use buslink_server::{Method, Object, ObjectBuilder, Property, Service, Signal};
use buslink_types::introspect::ChangeMode;
use buslink_types::{BusConfig, BusError, ObjectPath, Value};
use buslink_wire::{Connection, MemoryBus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

const NAME: &str = "com.example.Calc";
const WAIT: Duration = Duration::from_secs(2);

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
// Fixture
// ---------------------------------------------------------------------------

fn calculator(version: Arc<AtomicU32>) -> Object {
    ObjectBuilder::new(NAME)
        .method(Method::new("add", |(a, b): (i32, i32)| async move { Ok((a + b,)) }))
        .method(Method::new("slow", |(ms,): (u32,)| async move {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(())
        }))
        .property(Property::new("count", 0i32))
        .property(Property::new("label", "calc".to_string()).read_only())
        .property(Property::new("cache_size", 8u32).change_mode(ChangeMode::Invalidates))
        .property(Property::computed("version", move || version.load(Ordering::SeqCst)))
        .signal(Signal::new::<(u32,)>("overflow"))
        .build()
        .unwrap()
}

struct Harness {
    _bus: MemoryBus,
    service: Arc<Service>,
    client: Arc<Connection>,
    version: Arc<AtomicU32>,
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
        version: Arc::new(AtomicU32::new(1)),
    }
}

impl Harness {
    fn export(&self, p: &str) -> Arc<Object> {
        self.service
            .export(path(p), calculator(Arc::clone(&self.version)))
            .unwrap()
    }

    fn service_unique_name(&self) -> String {
        self.service.connection().unique_name().to_string()
    }

    async fn proxy(&self, p: &str) -> Proxy {
        let proxy = Proxy::new(Arc::clone(&self.client), NAME, path(p), None);
        assert_ok!(proxy.update().await);
        proxy
    }
}

/// Wait until `name` is cached as `want`.
async fn settles_at(cache: &PropertyCache, name: &str, want: &Value) -> bool {
    let until = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < until {
        if cache.cached(name).as_ref() == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Proxy lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_accessors_fail_before_update() {
    let h = harness().await;
    h.export("/calc");
    let proxy = Proxy::new(Arc::clone(&h.client), NAME, path("/calc"), None);
    assert!(!proxy.is_ready());
    assert!(matches!(proxy.method("add"), Err(BusError::NotReady(_))));
    assert!(matches!(proxy.children(), Err(BusError::NotReady(_))));
    assert!(matches!(proxy.child("x").await, Err(BusError::NotReady(_))));

    assert_ok!(proxy.update().await);
    assert!(proxy.is_ready());
    assert_eq!(proxy.default_interface(), NAME);
}

#[tokio::test]
async fn test_proxy_calls_introspected_method() {
    let h = harness().await;
    h.export("/calc");
    let proxy = h.proxy("/calc").await;

    let (sum,): (i32,) = proxy.call("add", (2i32, 3i32)).await.unwrap();
    assert_eq!(sum, 5);
    let (sum,): (i32,) = proxy.call("Add", (40i32, 2i32)).await.unwrap();
    assert_eq!(sum, 42);

    let err = proxy.method("add").unwrap().call_values(vec![Value::Str("2".into())]).await;
    assert!(matches!(err, Err(BusError::SignatureMismatch { .. })));
    assert!(matches!(proxy.method("subtract"), Err(BusError::NotFound(_))));
}

#[tokio::test]
async fn test_child_proxy_is_ready_on_return() {
    let h = harness().await;
    h.export("/a/b");
    let parent = h.proxy("/a").await;
    assert_eq!(parent.children().unwrap(), vec!["b"]);

    let child = parent.child("b").await.unwrap();
    assert!(child.is_ready());
    assert_eq!(child.path().as_str(), "/a/b");
    let (sum,): (i32,) = child.call("add", (1i32, 1i32)).await.unwrap();
    assert_eq!(sum, 2);

    assert!(matches!(parent.child("c").await, Err(BusError::NotFound(_))));
}

#[tokio::test]
async fn test_update_rebuilds_interfaces() {
    let h = harness().await;
    let proxy = h.proxy("/").await;
    assert!(proxy.interface(Some(NAME)).is_err());

    h.export("/");
    assert_ok!(proxy.update().await);
    assert!(proxy.interface(Some(NAME)).is_ok());
}

// ---------------------------------------------------------------------------
// Property cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_set_reaches_subscribed_cache() {
    let h = harness().await;
    h.export("/calc");
    let proxy = h.proxy("/calc").await;
    let iface = proxy.interface(None).unwrap();
    let mut changes = iface.cache().subscribe();
    assert_eq!(iface.cache().cached("Count"), Some(Value::Int32(0)));

    proxy.property("count").unwrap().set(42i32).await.unwrap();
    let names = tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(names, vec!["Count"]);
    assert_eq!(iface.cache().cached("Count"), Some(Value::Int32(42)));
}

#[tokio::test]
async fn test_batch_is_one_cache_update() {
    let h = harness().await;
    let calc = h.export("/calc");
    let proxy = h.proxy("/calc").await;
    let cache = Arc::clone(proxy.interface(None).unwrap().cache());
    let mut changes = cache.subscribe();

    let batch = calc.begin_update();
    for n in 1..=5i32 {
        calc.update("Count", n).await.unwrap();
    }
    calc.update("Label", "renamed").await.unwrap();
    batch.end().await.unwrap();

    let mut names = tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    names.sort();
    assert_eq!(names, vec!["Count", "Label"]);
    assert_eq!(cache.cached("Count"), Some(Value::Int32(5)));
    assert_eq!(cache.cached("Label"), Some(Value::Str("renamed".into())));
    let extra = tokio::time::timeout(Duration::from_millis(100), changes.recv()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn test_invalidated_value_is_refetched() {
    let h = harness().await;
    let calc = h.export("/calc");
    let proxy = h.proxy("/calc").await;
    let cache = Arc::clone(proxy.interface(None).unwrap().cache());
    let mut changes = cache.subscribe();

    calc.update("CacheSize", 32u32).await.unwrap();
    tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(cache.cached("CacheSize"), None);

    let size: u32 = proxy.property("cache_size").unwrap().get_as().await.unwrap();
    assert_eq!(size, 32);
    assert_eq!(cache.cached("CacheSize"), Some(Value::Uint32(32)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_rapid_updates_leave_cache_at_final_value() {
    let h = harness().await;
    let calc = h.export("/calc");
    let proxy = h.proxy("/calc").await;
    let cache = Arc::clone(proxy.interface(None).unwrap().cache());

    for round in 0..10i32 {
        let base = round * 200;
        for n in 1..=200 {
            calc.update("Count", base + n).await.unwrap();
        }
        let last = Value::Int32(base + 200);
        assert!(
            settles_at(&cache, "Count", &last).await,
            "round {round}: cached {:?}, server {last:?}",
            cache.cached("Count")
        );
        // A late older notification must not overwrite the final value.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.cached("Count"), Some(last));
    }
}

#[tokio::test]
async fn test_proxy_addressed_by_unique_name_follows_changes() {
    let h = harness().await;
    let calc = h.export("/calc");
    let unique = h.service_unique_name();
    let proxy = Proxy::new(Arc::clone(&h.client), &unique, path("/calc"), Some(NAME));
    assert_ok!(proxy.update().await);
    let iface = proxy.interface(None).unwrap();
    let mut changes = iface.cache().subscribe();

    calc.update("Count", 42i32).await.unwrap();
    tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(iface.cache().cached("Count"), Some(Value::Int32(42)));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _guard = proxy
        .signal("overflow")
        .unwrap()
        .connect(move |(n,): (u32,)| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(n);
            }
        })
        .await
        .unwrap();
    calc.emit("Overflow", (3u32,)).await.unwrap();
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_silent_property_is_read_live() {
    let h = harness().await;
    h.export("/calc");
    let proxy = h.proxy("/calc").await;
    let version = proxy.property("version").unwrap();
    assert_eq!(version.get().await.unwrap(), Value::Uint32(1));
    h.version.store(2, Ordering::SeqCst);
    assert_eq!(version.get().await.unwrap(), Value::Uint32(2));
}

#[tokio::test]
async fn test_read_only_property_rejected_locally() {
    let h = harness().await;
    h.export("/calc");
    let proxy = h.proxy("/calc").await;
    let err = proxy.property("label").unwrap().set("x").await.unwrap_err();
    assert!(matches!(err, BusError::Permission(_)));
}

// ---------------------------------------------------------------------------
// Signals and calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_signal_connect_checks_signature() {
    let h = harness().await;
    let calc = h.export("/calc");
    let proxy = h.proxy("/calc").await;
    let signal = proxy.signal("overflow").unwrap();
    let before = h.client.listeners().len();

    let err = signal
        .connect(|(_s,): (String,)| async {})
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BusError::SignatureMismatch { .. }));
    assert_eq!(h.client.listeners().len(), before);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _guard = signal
        .connect(move |(n,): (u32,)| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(n);
            }
        })
        .await
        .unwrap();
    calc.emit("Overflow", (9u32,)).await.unwrap();
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some(9));
}

#[tokio::test]
async fn test_per_call_timeout_override() {
    let h = harness().await;
    h.export("/calc");
    let remote = RemoteObject::new(Arc::clone(&h.client), NAME, path("/calc"), NAME);

    let err = assert_err!(
        remote
            .with_timeout(Duration::from_millis(20))
            .call::<_, ()>("Slow", (200u32,))
            .await
    );
    assert_eq!(err, BusError::Timeout(Duration::from_millis(20)));
    assert_ok!(remote.call::<_, ()>("Slow", (1u32,)).await);
    assert!(h.client.pending().is_empty());

    let all = remote.get_all().await.unwrap();
    assert_eq!(all["Label"], Value::Str("calc".into()));
    let count: i32 = remote.get("Count").await.unwrap();
    assert_eq!(count, 0);
}
