//! One shared link to the bus.
//!
//! A [`Connection`] owns the pending-call table, the listener registry and
//! the configuration. Every proxy, cache and exported object built on it
//! shares it through an `Arc`. Outbound writes go through a single async
//! lock so concurrent senders never interleave.

use crate::call::PendingCalls;
use crate::listen::{ListenerHandle, ListenerRegistry, SignalHandler};
use crate::rule::MatchRule;
use crate::transport::Transport;
use async_trait::async_trait;
use buslink_types::error::names;
use buslink_types::standard::{BUS_INTERFACE, BUS_NAME, BUS_PATH};
use buslink_types::{
    BusConfig, BusError, BusResult, Message, MessageKind, ObjectPath, SignatureSpec, Value,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Receives inbound method calls.
#[async_trait]
pub trait MethodDispatcher: Send + Sync + 'static {
    /// Handle one call. `None` means nothing is sent back.
    async fn dispatch(&self, conn: &Arc<Connection>, call: &Message) -> Option<Message>;
}

/// A bus connection shared by every component that talks over it.
pub struct Connection {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    send_lock: tokio::sync::Mutex<()>,
    pending: PendingCalls,
    listeners: ListenerRegistry,
    dispatcher: RwLock<Option<Weak<dyn MethodDispatcher>>>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            send_lock: tokio::sync::Mutex::new(()),
            pending: PendingCalls::new(),
            listeners: ListenerRegistry::new(),
            dispatcher: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn unique_name(&self) -> &str {
        self.transport.unique_name()
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Install the receiver for inbound method calls. Held weakly so the
    /// dispatcher can own the connection.
    pub fn set_dispatcher(&self, dispatcher: Weak<dyn MethodDispatcher>) {
        *self.dispatcher.write().unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);
    }

    fn dispatcher(&self) -> Option<Arc<dyn MethodDispatcher>> {
        self.dispatcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Send a message without waiting for anything. Returns its serial.
    pub async fn send(&self, mut msg: Message) -> BusResult<u32> {
        let _guard = self.send_lock.lock().await;
        if msg.serial == 0 {
            msg.serial = self.pending.next_serial();
        }
        let serial = msg.serial;
        self.transport.send(msg).await?;
        Ok(serial)
    }

    /// Send a method call and wait for its reply message.
    ///
    /// An error reply comes back as a message of kind
    /// [`MessageKind::Error`]; see [`Connection::call`] for the decoded form.
    pub async fn call_message(&self, mut msg: Message, timeout: Duration) -> BusResult<Message> {
        let (serial, rx) = {
            let _guard = self.send_lock.lock().await;
            let serial = self.pending.next_serial();
            msg.serial = serial;
            let rx = self.pending.register(serial);
            if let Err(e) = self.transport.send(msg).await {
                self.pending.cancel(serial);
                return Err(e);
            }
            (serial, rx)
        };
        debug!(serial, "Call sent");
        self.pending.wait(serial, rx, timeout).await
    }

    /// Send a method call; return the reply body or the remote error.
    pub async fn call(&self, msg: Message, timeout: Duration) -> BusResult<Vec<Value>> {
        if msg.no_reply_expected {
            self.send(msg).await?;
            return Ok(Vec::new());
        }
        self.call_message(msg, timeout).await?.into_result()
    }

    /// Emit a signal.
    pub async fn emit(
        &self,
        path: ObjectPath,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> BusResult<()> {
        debug!(path = %path, interface, member, "Emitting signal");
        self.send(Message::signal(path, interface, member, body))
            .await
            .map(|_| ())
    }

    /// Route one inbound message.
    pub async fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg.kind {
            MessageKind::MethodReturn | MessageKind::Error => {
                self.pending.resolve(msg);
            }
            MessageKind::Signal => {
                self.listeners.dispatch(&msg);
            }
            MessageKind::MethodCall => {
                let conn = Arc::clone(self);
                tokio::spawn(async move { conn.handle_call(msg).await });
            }
        }
    }

    async fn handle_call(self: Arc<Self>, call: Message) {
        let reply = match self.dispatcher() {
            Some(dispatcher) => {
                match AssertUnwindSafe(dispatcher.dispatch(&self, &call))
                    .catch_unwind()
                    .await
                {
                    Ok(reply) => reply,
                    Err(_) => {
                        error!(member = %call.member(), "Method handler panicked");
                        Some(Message::error(&call, names::FAILED, "method handler panicked"))
                    }
                }
            }
            None => Some(Message::error(
                &call,
                names::UNKNOWN_OBJECT,
                "no objects are exported on this connection",
            )),
        };
        if call.no_reply_expected {
            return;
        }
        if let Some(reply) = reply {
            if let Err(e) = self.send(reply).await {
                warn!(error = %e, member = %call.member(), "Failed to send reply");
            }
        }
    }

    /// Register a signal listener and, when it is the first user of its
    /// rule, ask the bus to route matching signals here.
    ///
    /// Signature validation happens before any message is sent.
    pub async fn add_listener(
        &self,
        rule: MatchRule,
        handler: Arc<dyn SignalHandler>,
        signature: Option<SignatureSpec>,
    ) -> BusResult<ListenerHandle> {
        let (handle, first) = self.listeners.register(rule.clone(), handler, signature)?;
        if first && self.config.match_rules {
            if let Err(e) = self.bus_call("AddMatch", rule.to_string()).await {
                self.listeners.unregister(handle);
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Remove a listener; the bus rule goes away with its last user.
    pub async fn remove_listener(&self, handle: ListenerHandle) -> BusResult<()> {
        let Some((rule, last)) = self.listeners.unregister(handle) else {
            return Err(BusError::NotFound(format!("listener {}", handle.id())));
        };
        if last && self.config.match_rules {
            self.bus_call("RemoveMatch", rule.to_string()).await?;
        }
        Ok(())
    }

    /// Unique name currently owning `name`.
    pub async fn name_owner(&self, name: &str) -> BusResult<String> {
        let reply = self.bus_call("GetNameOwner", name.to_string()).await?;
        reply
            .first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BusError::TypeMismatch("GetNameOwner reply is not a string".into()))
    }

    async fn bus_call(&self, member: &str, arg: String) -> BusResult<Vec<Value>> {
        let path = ObjectPath::new(BUS_PATH)?;
        let msg = Message::method_call(
            Some(BUS_NAME),
            path,
            Some(BUS_INTERFACE),
            member,
            vec![Value::Str(arg)],
        );
        self.call(msg, self.config.call_timeout()).await
    }
}

/// Unregisters its listener when dropped.
pub struct ListenerGuard {
    conn: Weak<Connection>,
    handle: Option<ListenerHandle>,
}

impl ListenerGuard {
    pub fn new(conn: &Arc<Connection>, handle: ListenerHandle) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<ListenerHandle> {
        self.handle
    }

    /// Unregister now and wait for the bus to drop the rule.
    pub async fn remove(mut self) -> BusResult<()> {
        match (self.handle.take(), self.conn.upgrade()) {
            (Some(handle), Some(conn)) => conn.remove_listener(handle).await,
            _ => Ok(()),
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let (Some(handle), Some(conn)) = (self.handle.take(), self.conn.upgrade()) else {
            return;
        };
        let Some((rule, last)) = conn.listeners.unregister(handle) else {
            return;
        };
        if !last || !conn.config.match_rules {
            return;
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = conn.bus_call("RemoveMatch", rule.to_string()).await {
                    debug!(error = %e, "RemoveMatch on guard drop failed");
                }
            });
        }
    }
}
