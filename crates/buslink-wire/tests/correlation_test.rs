//! Integration tests for call correlation and signal routing.
//!
//! Real `Connection`s are wired through an in-process `MemoryBus`; no
//! external bus is contacted.

use async_trait::async_trait;
use buslink_types::{BusConfig, BusError, Message, ObjectPath, SignatureSpec, Value};
use buslink_wire::{
    dynamic_handler, typed_handler, Connection, ListenerGuard, MatchRule, MemoryBus,
    MethodDispatcher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Mock service: echoes after a delay chosen by the caller
// ---------------------------------------------------------------------------

struct Delayed;

#[async_trait]
impl MethodDispatcher for Delayed {
    async fn dispatch(&self, _conn: &Arc<Connection>, call: &Message) -> Option<Message> {
        let delay = match call.body.first() {
            Some(Value::Uint32(ms)) => *ms,
            _ => 0,
        };
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        match call.member() {
            "Echo" => Some(Message::method_return(call, call.body.clone())),
            "Fail" => Some(Message::error(call, "com.example.Error.Nope", "refused")),
            "Panic" => panic!("handler blew up"),
            _ => Some(Message::error(call, "org.freedesktop.DBus.Error.UnknownMethod", "?")),
        }
    }
}

async fn service(bus: &MemoryBus) -> (Arc<Connection>, Arc<Delayed>) {
    let conn = assert_ok!(bus.connect(BusConfig::named("com.example.Delay")).await);
    let svc = Arc::new(Delayed);
    let weak: std::sync::Weak<dyn MethodDispatcher> = Arc::downgrade(&svc) as _;
    conn.set_dispatcher(weak);
    (conn, svc)
}

fn echo(delay_ms: u32) -> Message {
    Message::method_call(
        Some("com.example.Delay"),
        ObjectPath::new("/delay").unwrap(),
        Some("com.example.Delay"),
        "Echo",
        vec![Value::Uint32(delay_ms)],
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() {
    init_tracing();
    let bus = MemoryBus::new();
    let _svc = service(&bus).await;
    let client = bus.connect(BusConfig::default()).await.unwrap();

    // Later calls answer first.
    let calls = (0..8u32).map(|i| {
        let client = Arc::clone(&client);
        async move { client.call(echo(80 - i * 10), Duration::from_secs(2)).await }
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        let body = result.unwrap();
        assert_eq!(body, vec![Value::Uint32(80 - i as u32 * 10)]);
    }
    assert!(client.pending().is_empty());
}

#[tokio::test]
async fn test_late_reply_is_dropped_not_misdelivered() {
    init_tracing();
    let bus = MemoryBus::new();
    let _svc = service(&bus).await;
    let client = bus.connect(BusConfig::default()).await.unwrap();

    let err = assert_err!(client.call(echo(80), Duration::from_millis(20)).await);
    assert_eq!(err, BusError::Timeout(Duration::from_millis(20)));
    assert!(client.pending().is_empty());

    // The stale reply for the first call lands while this one is waiting.
    let body = client.call(echo(150), Duration::from_secs(2)).await.unwrap();
    assert_eq!(body, vec![Value::Uint32(150)]);
}

#[tokio::test]
async fn test_remote_error_and_panic_surface_as_errors() {
    let bus = MemoryBus::new();
    let _svc = service(&bus).await;
    let client = bus.connect(BusConfig::default()).await.unwrap();

    let mut fail = echo(0);
    fail.member = Some("Fail".into());
    let err = client.call(fail, Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err, BusError::remote("com.example.Error.Nope", "refused"));

    let mut boom = echo(0);
    boom.member = Some("Panic".into());
    let err = client.call(boom, Duration::from_secs(1)).await.unwrap_err();
    assert!(
        matches!(err, BusError::Remote { ref name, .. } if name == "org.freedesktop.DBus.Error.Failed")
    );

    // Dispatch keeps working after a panic.
    assert_ok!(client.call(echo(0), Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_unknown_destination_is_service_unknown() {
    let bus = MemoryBus::new();
    let client = bus.connect(BusConfig::default()).await.unwrap();
    let msg = Message::method_call(Some("com.example.Nobody"), ObjectPath::root(), None, "X", vec![]);
    let err = client.call(msg, Duration::from_secs(1)).await.unwrap_err();
    assert!(
        matches!(err, BusError::Remote { ref name, .. } if name == "org.freedesktop.DBus.Error.ServiceUnknown")
    );
}

#[tokio::test]
async fn test_signals_reach_only_matching_listeners() {
    init_tracing();
    let bus = MemoryBus::new();
    let (emitter, _svc) = service(&bus).await;
    let client = bus.connect(BusConfig::default()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let rule = MatchRule::signal()
        .sender("com.example.Delay")
        .interface("com.example.Delay")
        .member("Tick");
    let typed_tx = tx.clone();
    let handle = client
        .add_listener(
            rule.clone(),
            typed_handler(move |(n,): (u32,)| {
                let tx = typed_tx.clone();
                async move {
                    let _ = tx.send(format!("tick {n}"));
                }
            }),
            None,
        )
        .await
        .unwrap();
    let _guard = ListenerGuard::new(&client, handle);
    client
        .add_listener(
            rule,
            dynamic_handler(move |msg: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(format!("any {}", msg.signature()));
                }
            }),
            Some(SignatureSpec::Any),
        )
        .await
        .unwrap();

    let path = ObjectPath::new("/delay").unwrap();
    emitter
        .emit(path.clone(), "com.example.Delay", "Other", vec![Value::Uint32(1)])
        .await
        .unwrap();
    emitter
        .emit(path.clone(), "com.example.Delay", "Tick", vec![Value::Str("x".into())])
        .await
        .unwrap();
    emitter
        .emit(path, "com.example.Delay", "Tick", vec![Value::Uint32(3)])
        .await
        .unwrap();

    let mut got = Vec::new();
    for _ in 0..3 {
        let item = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        got.push(item.unwrap().unwrap());
    }
    got.sort();
    assert_eq!(got, vec!["any s", "any u", "tick 3"]);
}

#[tokio::test]
async fn test_guard_drop_removes_listener() {
    let bus = MemoryBus::new();
    let client = bus.connect(BusConfig::default()).await.unwrap();
    let handle = client
        .add_listener(MatchRule::signal().member("Tick"), dynamic_handler(|_| async {}), None)
        .await
        .unwrap();
    let guard = ListenerGuard::new(&client, handle);
    assert_eq!(client.listeners().len(), 1);
    drop(guard);
    assert!(client.listeners().is_empty());
}

#[tokio::test]
async fn test_signal_sender_is_unique_name() {
    let bus = MemoryBus::new();
    let (emitter, _svc) = service(&bus).await;
    let client = bus.connect(BusConfig::default()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // One listener filters on the well-known name, one on the unique name.
    for sender in ["com.example.Delay".to_string(), emitter.unique_name().to_string()] {
        let tx = tx.clone();
        let label = sender.clone();
        client
            .add_listener(
                MatchRule::signal().sender(sender).member("Tick"),
                dynamic_handler(move |msg: Message| {
                    let tx = tx.clone();
                    let label = label.clone();
                    async move {
                        let _ = tx.send((label, msg.sender));
                    }
                }),
                None,
            )
            .await
            .unwrap();
    }

    emitter
        .emit(ObjectPath::root(), "com.example.Delay", "Tick", vec![])
        .await
        .unwrap();
    let mut got = Vec::new();
    for _ in 0..2 {
        let item = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        got.push(item.unwrap().unwrap());
    }
    got.sort();
    let unique = Some(emitter.unique_name().to_string());
    assert_eq!(got[0], (emitter.unique_name().to_string(), unique.clone()));
    assert_eq!(got[1], ("com.example.Delay".to_string(), unique));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_listeners_share_one_bus_rule() {
    let bus = MemoryBus::new();
    let client = bus.connect(BusConfig::default()).await.unwrap();
    let rule = MatchRule::signal().member("Tick");

    let adds = (0..8).map(|_| {
        let client = Arc::clone(&client);
        let rule = rule.clone();
        tokio::spawn(async move {
            client
                .add_listener(rule, dynamic_handler(|_| async {}), None)
                .await
        })
    });
    let mut handles = Vec::new();
    for add in adds {
        handles.push(add.await.unwrap().unwrap());
    }
    assert_eq!(bus.rules_of(client.unique_name()), vec![rule.clone()]);

    for handle in handles {
        assert_ok!(client.remove_listener(handle).await);
    }
    assert!(bus.rules_of(client.unique_name()).is_empty());
    assert!(client.listeners().is_empty());
}
