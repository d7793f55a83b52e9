//! Listener registry.
//!
//! Handlers subscribe to signals through a [`MatchRule`]. Each registration
//! carries the signature its handler decodes: inferred from the handler's
//! argument types, optionally pinned by the caller, or explicitly
//! [`SignatureSpec::Any`]. Each registration owns a queue drained by one
//! worker task: handlers never run on the routing path, and one handler sees
//! its signals in arrival order.

use crate::rule::MatchRule;
use async_trait::async_trait;
use buslink_types::value::coerce_values;
use buslink_types::{Args, BusError, BusResult, Message, SignatureSpec};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Something that reacts to a signal.
#[async_trait]
pub trait SignalHandler: Send + Sync + 'static {
    /// Payload shape this handler decodes.
    fn signature(&self) -> SignatureSpec;

    /// Handle one matching signal.
    async fn handle(&self, msg: Message);
}

type HandlerFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler decoding the body into a fixed argument tuple.
struct TypedHandler<A> {
    f: HandlerFn<A>,
}

#[async_trait]
impl<A: Args + Send + 'static> SignalHandler for TypedHandler<A> {
    fn signature(&self) -> SignatureSpec {
        SignatureSpec::Exact(A::signature())
    }

    async fn handle(&self, msg: Message) {
        let member = msg.member().to_string();
        match coerce_values(msg.body, &A::signature()).and_then(A::from_values) {
            Ok(args) => (self.f)(args).await,
            Err(e) => warn!(member = %member, error = %e, "Signal payload did not decode"),
        }
    }
}

/// Handler receiving the whole message, any payload shape.
struct DynamicHandler {
    f: HandlerFn<Message>,
}

#[async_trait]
impl SignalHandler for DynamicHandler {
    fn signature(&self) -> SignatureSpec {
        SignatureSpec::Any
    }

    async fn handle(&self, msg: Message) {
        (self.f)(msg).await
    }
}

/// Wrap a closure taking decoded arguments.
///
/// The inferred signature is `A`'s: one code per tuple element, `v` for
/// [`Value`](buslink_types::Value) parameters.
pub fn typed_handler<A, F, Fut>(f: F) -> Arc<dyn SignalHandler>
where
    A: Args + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(TypedHandler {
        f: Arc::new(move |args: A| f(args).boxed()),
    })
}

/// Wrap a closure taking the raw message (unchecked, any shape).
pub fn dynamic_handler<F, Fut>(f: F) -> Arc<dyn SignalHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(DynamicHandler {
        f: Arc::new(move |msg: Message| f(msg).boxed()),
    })
}

/// Combine a handler's inferred signature with an optional declared one.
pub fn resolve_signature(
    inferred: SignatureSpec,
    declared: Option<SignatureSpec>,
) -> BusResult<SignatureSpec> {
    if let SignatureSpec::Exact(sig) = &inferred {
        sig.check_len()?;
    }
    match (declared, inferred) {
        (None, inferred) => Ok(inferred),
        (Some(SignatureSpec::Any), _) => Ok(SignatureSpec::Any),
        (Some(SignatureSpec::Exact(d)), SignatureSpec::Any) => Ok(SignatureSpec::Exact(d)),
        (Some(SignatureSpec::Exact(d)), SignatureSpec::Exact(i)) => {
            if i.accepts(&d) {
                Ok(SignatureSpec::Exact(d))
            } else {
                Err(BusError::SignatureMismatch {
                    expected: d.to_string(),
                    actual: i.to_string(),
                })
            }
        }
    }
}

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

struct Listener {
    rule: MatchRule,
    handler: Arc<dyn SignalHandler>,
    spec: SignatureSpec,
    queue: mpsc::UnboundedSender<Message>,
}

/// Run `handler` over everything queued for registration `id`, one message
/// at a time. Ends when the registration is dropped.
fn spawn_worker(
    id: u64,
    handler: Arc<dyn SignalHandler>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> BusResult<()> {
    let rt = tokio::runtime::Handle::try_current()
        .map_err(|_| BusError::Transport("listeners need a running tokio runtime".into()))?;
    rt.spawn(async move {
        while let Some(msg) = rx.recv().await {
            let member = msg.member().to_string();
            if AssertUnwindSafe(handler.handle(msg))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(id, member = %member, "Signal handler panicked");
            }
        }
        debug!(id, "Listener worker stopped");
    });
    Ok(())
}

/// All signal registrations of one connection.
pub struct ListenerRegistry {
    listeners: DashMap<u64, Listener>,
    /// Registrations per rule; the bus holds one copy of each rule.
    rule_users: DashMap<MatchRule, usize>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            rule_users: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a registration. The same handler registered twice for the same
    /// rule yields the first handle.
    ///
    /// The flag is true for exactly one caller per rule going from unused to
    /// used, however many register it concurrently.
    pub fn register(
        &self,
        rule: MatchRule,
        handler: Arc<dyn SignalHandler>,
        signature: Option<SignatureSpec>,
    ) -> BusResult<(ListenerHandle, bool)> {
        let spec = resolve_signature(handler.signature(), signature)?;
        if let Some(existing) = self
            .listeners
            .iter()
            .find(|l| l.rule == rule && Arc::ptr_eq(&l.handler, &handler))
        {
            debug!(id = *existing.key(), rule = %rule, "Listener already registered");
            return Ok((ListenerHandle(*existing.key()), false));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::unbounded_channel();
        spawn_worker(id, Arc::clone(&handler), rx)?;
        let first = {
            let mut users = self.rule_users.entry(rule.clone()).or_insert(0);
            *users += 1;
            *users == 1
        };
        debug!(id, rule = %rule, signature = %spec, "Listener registered");
        self.listeners.insert(
            id,
            Listener {
                rule,
                handler,
                spec,
                queue,
            },
        );
        Ok((ListenerHandle(id), first))
    }

    /// Remove a registration, returning its rule and whether that was the
    /// rule's last user.
    pub fn unregister(&self, handle: ListenerHandle) -> Option<(MatchRule, bool)> {
        let (id, listener) = self.listeners.remove(&handle.0)?;
        debug!(id, rule = %listener.rule, "Listener removed");
        let last = match self.rule_users.entry(listener.rule.clone()) {
            Entry::Occupied(mut users) => {
                *users.get_mut() -= 1;
                if *users.get() == 0 {
                    users.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };
        Some((listener.rule, last))
    }

    /// Number of registrations using `rule`.
    pub fn rule_count(&self, rule: &MatchRule) -> usize {
        self.rule_users.get(rule).map_or(0, |users| *users)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Queue `msg` for every handler whose rule and signature accept it.
    /// Returns how many were queued.
    pub fn dispatch(&self, msg: &Message) -> usize {
        let actual = msg.signature();
        let mut queued = 0;
        for l in self.listeners.iter() {
            if !l.rule.matches_delivered(msg) {
                continue;
            }
            if let SignatureSpec::Exact(want) = &l.spec {
                if !want.accepts(&actual) {
                    debug!(
                        id = *l.key(),
                        expected = %want,
                        actual = %actual,
                        "Signal skipped: signature mismatch"
                    );
                    continue;
                }
            }
            if l.queue.send(msg.clone()).is_ok() {
                queued += 1;
            }
        }
        queued
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
