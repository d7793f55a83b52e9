//! In-process bus.
//!
//! [`MemoryBus`] plays the bus daemon for connections living in the same
//! process: it hands out unique names, arbitrates well-known names, keeps
//! each peer's match rules, routes calls by destination and fans signals out
//! to interested peers. Each peer gets an unbounded queue drained by one
//! reader task, so inbound messages reach [`Connection::dispatch`] one at a
//! time and in order.

use crate::connection::Connection;
use crate::rule::{is_unique_name, MatchRule};
use crate::transport::Transport;
use async_trait::async_trait;
use buslink_types::error::names;
use buslink_types::standard::BUS_NAME;
use buslink_types::{BusConfig, BusError, BusKind, BusResult, Message, MessageKind, Value};
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";

/// Outcome of a well-known name claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

struct Peer {
    tx: mpsc::UnboundedSender<Message>,
    rules: Vec<MatchRule>,
    match_rules: bool,
}

struct NameEntry {
    owner: String,
    allow_replacement: bool,
    queue: VecDeque<(String, bool)>,
}

struct BusState {
    kind: BusKind,
    next_id: AtomicU64,
    serial: AtomicU32,
    peers: DashMap<String, Peer>,
    names: Mutex<BTreeMap<String, NameEntry>>,
}

/// An in-process bus daemon.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<BusState>,
}

impl MemoryBus {
    /// An in-process session bus.
    pub fn new() -> Self {
        Self::with_kind(BusKind::Session)
    }

    /// An in-process bus standing in for `kind`. Only configs asking for
    /// that bus may connect.
    pub fn with_kind(kind: BusKind) -> Self {
        Self {
            state: Arc::new(BusState {
                kind,
                next_id: AtomicU64::new(1),
                serial: AtomicU32::new(1),
                peers: DashMap::new(),
                names: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Attach a new connection, claiming `config.name` if set.
    pub async fn connect(&self, config: BusConfig) -> BusResult<Arc<Connection>> {
        if config.bus != self.state.kind {
            return Err(BusError::Transport(format!(
                "config asks for the {:?} bus, this is the {:?} bus",
                config.bus, self.state.kind
            )));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let unique = format!(":1.{id}");
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.peers.insert(
            unique.clone(),
            Peer {
                tx,
                rules: Vec::new(),
                match_rules: config.match_rules,
            },
        );

        let claim = config.name.clone();
        let replace = config.replace_existing;
        let allow = config.allow_replacement;
        let queue = config.name_queue;
        let transport = Arc::new(MemoryTransport {
            bus: Arc::clone(&self.state),
            unique_name: unique.clone(),
        });
        let conn = Connection::new(transport, config);
        spawn_reader(Arc::downgrade(&conn), rx);

        if let Some(name) = claim {
            match self.state.request_name(&unique, &name, replace, allow, queue) {
                NameReply::Exists => {
                    return Err(BusError::Transport(format!(
                        "name '{name}' is already owned"
                    )));
                }
                reply => info!(unique = %unique, name = %name, ?reply, "Name requested"),
            }
        }
        debug!(unique = %unique, "Peer connected");
        Ok(conn)
    }

    /// Unique name owning `name` (a well-known or unique name).
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.state.owner_of(name)
    }

    pub fn kind(&self) -> BusKind {
        self.state.kind
    }

    pub fn peer_count(&self) -> usize {
        self.state.peers.len()
    }

    /// Match rules the bus holds for peer `unique`.
    pub fn rules_of(&self, unique: &str) -> Vec<MatchRule> {
        self.state
            .peers
            .get(unique)
            .map(|p| p.rules.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reader(conn: Weak<Connection>, mut rx: mpsc::UnboundedReceiver<Message>) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Some(conn) = conn.upgrade() else {
                break;
            };
            conn.dispatch(msg).await;
        }
    });
}

impl BusState {
    fn request_name(
        &self,
        unique: &str,
        name: &str,
        replace_existing: bool,
        allow_replacement: bool,
        name_queue: bool,
    ) -> NameReply {
        let mut table = self.names.lock().unwrap_or_else(|e| e.into_inner());
        match table.get_mut(name) {
            None => {
                table.insert(
                    name.to_string(),
                    NameEntry {
                        owner: unique.to_string(),
                        allow_replacement,
                        queue: VecDeque::new(),
                    },
                );
                NameReply::PrimaryOwner
            }
            Some(entry) if entry.owner == unique => NameReply::AlreadyOwner,
            Some(entry) if replace_existing && entry.allow_replacement => {
                debug!(name, previous = %entry.owner, owner = unique, "Name replaced");
                entry.owner = unique.to_string();
                entry.allow_replacement = allow_replacement;
                NameReply::PrimaryOwner
            }
            Some(entry) if name_queue => {
                entry.queue.push_back((unique.to_string(), allow_replacement));
                NameReply::InQueue
            }
            Some(_) => NameReply::Exists,
        }
    }

    fn owner_of(&self, name: &str) -> Option<String> {
        if is_unique_name(name) {
            return self.peers.contains_key(name).then(|| name.to_string());
        }
        let table = self.names.lock().unwrap_or_else(|e| e.into_inner());
        table.get(name).map(|e| e.owner.clone())
    }

    fn disconnect(&self, unique: &str) {
        self.peers.remove(unique);
        let mut table = self.names.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|name, entry| {
            entry.queue.retain(|(q, _)| q != unique);
            if entry.owner != unique {
                return true;
            }
            match entry.queue.pop_front() {
                Some((next, allow)) => {
                    debug!(name = %name, owner = %next, "Name passed to queued peer");
                    entry.owner = next;
                    entry.allow_replacement = allow;
                    true
                }
                None => false,
            }
        });
        debug!(unique, "Peer disconnected");
    }

    fn deliver(&self, unique: &str, msg: Message) {
        match self.peers.get(unique) {
            Some(peer) => {
                if peer.tx.send(msg).is_err() {
                    debug!(unique, "Peer queue closed");
                }
            }
            None => debug!(unique, "Dropping message for vanished peer"),
        }
    }

    fn route(&self, from: &str, mut msg: Message) {
        msg.sender = Some(from.to_string());

        let Some(dest) = msg.destination.clone() else {
            if msg.kind == MessageKind::Signal {
                self.broadcast(msg);
            } else {
                debug!(from, kind = %msg.kind, "Dropping message without destination");
            }
            return;
        };

        if dest == BUS_NAME {
            self.handle_bus_call(from, msg);
            return;
        }

        match self.owner_of(&dest) {
            Some(unique) => self.deliver(&unique, msg),
            None if msg.kind == MessageKind::MethodCall && !msg.no_reply_expected => {
                let mut reply = Message::error(
                    &msg,
                    names::SERVICE_UNKNOWN,
                    &format!("the name {dest} was not provided by any peer"),
                );
                reply.sender = Some(BUS_NAME.to_string());
                reply.serial = self.serial.fetch_add(1, Ordering::Relaxed);
                self.deliver(from, reply);
            }
            None => debug!(dest = %dest, "Dropping message for unknown name"),
        }
    }

    fn broadcast(&self, msg: Message) {
        let targets: Vec<mpsc::UnboundedSender<Message>> = self
            .peers
            .iter()
            .filter(|p| {
                !p.match_rules
                    || p.rules
                        .iter()
                        .any(|r| r.matches_with(&msg, |name| self.owner_of(name)))
            })
            .map(|p| p.tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(msg.clone());
        }
    }

    fn handle_bus_call(&self, from: &str, call: Message) {
        let result = match call.member() {
            "Hello" => Ok(vec![Value::Str(from.to_string())]),
            "AddMatch" => self.parse_rule(&call).map(|rule| {
                if let Some(mut peer) = self.peers.get_mut(from) {
                    peer.rules.push(rule);
                }
                Vec::new()
            }),
            "RemoveMatch" => self.parse_rule(&call).and_then(|rule| {
                let mut peer = self
                    .peers
                    .get_mut(from)
                    .ok_or_else(|| BusError::remote(names::FAILED, "unknown peer"))?;
                let pos = peer
                    .rules
                    .iter()
                    .position(|r| r == &rule)
                    .ok_or_else(|| BusError::remote(MATCH_RULE_NOT_FOUND, rule.to_string()))?;
                peer.rules.remove(pos);
                Ok(Vec::new())
            }),
            "GetNameOwner" => {
                let name = call.arg_str(0).unwrap_or_default();
                self.owner_of(name)
                    .map(|owner| vec![Value::Str(owner)])
                    .ok_or_else(|| {
                        BusError::remote(
                            names::NAME_HAS_NO_OWNER,
                            format!("could not get owner of name '{name}'"),
                        )
                    })
            }
            other => Err(BusError::remote(
                names::UNKNOWN_METHOD,
                format!("bus has no method '{other}'"),
            )),
        };
        if call.no_reply_expected {
            return;
        }
        let mut reply = match result {
            Ok(body) => Message::method_return(&call, body),
            Err(e) => Message::error_from(&call, &e),
        };
        reply.sender = Some(BUS_NAME.to_string());
        reply.serial = self.serial.fetch_add(1, Ordering::Relaxed);
        self.deliver(from, reply);
    }

    fn parse_rule(&self, call: &Message) -> BusResult<MatchRule> {
        let text = call
            .arg_str(0)
            .ok_or_else(|| BusError::remote(names::INVALID_ARGS, "expected a match rule"))?;
        MatchRule::parse(text).map_err(|e| BusError::remote(names::INVALID_ARGS, e.to_string()))
    }
}

/// Outbound half of an in-process peer.
struct MemoryTransport {
    bus: Arc<BusState>,
    unique_name: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, msg: Message) -> BusResult<()> {
        self.bus.route(&self.unique_name, msg);
        Ok(())
    }

    fn unique_name(&self) -> &str {
        &self.unique_name
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.bus.disconnect(&self.unique_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unique_names_and_claims() {
        let bus = MemoryBus::new();
        let a = bus.connect(BusConfig::named("com.example.A")).await.unwrap();
        let b = bus.connect(BusConfig::default()).await.unwrap();
        assert_ne!(a.unique_name(), b.unique_name());
        assert!(b.unique_name().starts_with(":1."));
        assert_eq!(bus.owner_of("com.example.A").as_deref(), Some(a.unique_name()));
    }

    #[tokio::test]
    async fn test_config_must_name_this_bus() {
        let bus = MemoryBus::with_kind(BusKind::System);
        assert!(bus.connect(BusConfig::default()).await.is_err());
        let config = BusConfig {
            bus: BusKind::System,
            ..BusConfig::default()
        };
        let conn = bus.connect(config).await.unwrap();
        assert_eq!(conn.config().bus, bus.kind());
        assert_eq!(bus.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_name_taken_without_queue() {
        let bus = MemoryBus::new();
        let _a = bus.connect(BusConfig::named("com.example.A")).await.unwrap();
        let mut config = BusConfig::named("com.example.A");
        config.name_queue = false;
        assert!(bus.connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_queued_name_passes_on_disconnect() {
        let bus = MemoryBus::new();
        let a = bus.connect(BusConfig::named("com.example.A")).await.unwrap();
        let b = bus.connect(BusConfig::named("com.example.A")).await.unwrap();
        assert_eq!(bus.owner_of("com.example.A").as_deref(), Some(a.unique_name()));
        drop(a);
        assert_eq!(bus.owner_of("com.example.A").as_deref(), Some(b.unique_name()));
        assert_eq!(bus.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_replacement_when_allowed() {
        let bus = MemoryBus::new();
        let mut first = BusConfig::named("com.example.A");
        first.allow_replacement = true;
        let _a = bus.connect(first).await.unwrap();
        let mut second = BusConfig::named("com.example.A");
        second.replace_existing = true;
        let b = bus.connect(second).await.unwrap();
        assert_eq!(bus.owner_of("com.example.A").as_deref(), Some(b.unique_name()));
    }

    #[tokio::test]
    async fn test_get_name_owner() {
        let bus = MemoryBus::new();
        let a = bus.connect(BusConfig::named("com.example.A")).await.unwrap();
        assert_eq!(a.name_owner("com.example.A").await.unwrap(), a.unique_name());
        let err = a.name_owner("com.example.Missing").await.unwrap_err();
        assert!(
            matches!(err, BusError::Remote { ref name, .. } if name == names::NAME_HAS_NO_OWNER)
        );
    }
}
