//! Client-side property cache.
//!
//! Values arrive three ways: a bulk fetch when the cache is seeded, a live
//! read when a property has nothing cached, and `PropertiesChanged`
//! notifications. Only the notification path overwrites or clears cached
//! entries, and each notification is applied under one write lock so readers
//! see either all of it or none of it.

use crate::call::RemoteObject;
use buslink_types::introspect::ChangeMode;
use buslink_types::standard::{PROPERTIES, PROPERTIES_CHANGED};
use buslink_types::{BusResult, BusType, Value};
use buslink_wire::{typed_handler, ListenerGuard, MatchRule};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Cached property values of one remote interface.
pub struct PropertyCache {
    remote: RemoteObject,
    values: RwLock<HashMap<String, Value>>,
    /// Properties that never announce changes are always read live.
    modes: RwLock<HashMap<String, ChangeMode>>,
    changes: broadcast::Sender<Vec<String>>,
    listener: Mutex<Option<ListenerGuard>>,
}

impl PropertyCache {
    pub fn new(remote: RemoteObject) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            remote,
            values: RwLock::new(HashMap::new()),
            modes: RwLock::new(HashMap::new()),
            changes,
            listener: Mutex::new(None),
        })
    }

    pub fn remote(&self) -> &RemoteObject {
        &self.remote
    }

    /// Record how `name` announces changes.
    pub fn set_mode(&self, name: &str, mode: ChangeMode) {
        self.modes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), mode);
    }

    fn is_live(&self, name: &str) -> bool {
        self.modes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .is_some_and(|m| *m == ChangeMode::None)
    }

    /// Start following `PropertiesChanged` for this interface.
    pub async fn attach(self: &Arc<Self>) -> BusResult<()> {
        // A well-known destination is resolved to its owner by the bus.
        let rule = MatchRule::signal()
            .sender(self.remote.destination())
            .path(self.remote.path().clone())
            .interface(PROPERTIES)
            .member(PROPERTIES_CHANGED)
            .arg(self.remote.interface());
        let cache: Weak<Self> = Arc::downgrade(self);
        let handler = typed_handler(
            move |(_, changed, invalidated): (String, BTreeMap<String, Value>, Vec<String>)| {
                let cache = cache.clone();
                async move {
                    if let Some(cache) = cache.upgrade() {
                        cache.apply(changed, invalidated);
                    }
                }
            },
        );
        let conn = self.remote.connection();
        let handle = conn.add_listener(rule, handler, None).await?;
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(ListenerGuard::new(conn, handle));
        if let Some(previous) = previous {
            previous.remove().await?;
        }
        Ok(())
    }

    /// Stop following notifications. Cached values stay as they are.
    pub async fn detach(&self) -> BusResult<()> {
        let guard = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match guard {
            Some(guard) => guard.remove().await,
            None => Ok(()),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Replace the cache with a full snapshot.
    pub fn seed(&self, all: BTreeMap<String, Value>) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.clear();
        values.extend(all.into_iter().filter(|(name, _)| !self.is_live(name)));
    }

    /// Fetch every property and seed the cache with the result.
    pub async fn refresh(&self) -> BusResult<()> {
        let all = self.remote.get_all().await?;
        debug!(interface = self.remote.interface(), count = all.len(), "Properties fetched");
        self.seed(all);
        Ok(())
    }

    /// Apply one change notification: new values overwrite, invalidated
    /// names are cleared. Subscribers get the affected names.
    pub fn apply(&self, changed: BTreeMap<String, Value>, invalidated: Vec<String>) {
        let mut names: Vec<String> = Vec::with_capacity(changed.len() + invalidated.len());
        {
            let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
            for (name, value) in changed {
                names.push(name.clone());
                values.insert(name, value);
            }
            for name in invalidated {
                values.remove(&name);
                names.push(name);
            }
        }
        if names.is_empty() {
            return;
        }
        debug!(interface = self.remote.interface(), changed = ?names, "Cache updated");
        // No subscribers is fine.
        let _ = self.changes.send(names);
    }

    /// Changed property names, one message per applied notification.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.changes.subscribe()
    }

    /// The cached value, without any bus traffic.
    pub fn cached(&self, name: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Cached value, or a live read when nothing is cached.
    pub async fn get(&self, name: &str) -> BusResult<Value> {
        if !self.is_live(name) {
            if let Some(value) = self.cached(name) {
                return Ok(value);
            }
        }
        let value = self.remote.get_value(name).await?;
        if !self.is_live(name) {
            self.values
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .entry(name.to_string())
                .or_insert_with(|| value.clone());
        }
        Ok(value)
    }

    pub async fn get_as<T: BusType>(&self, name: &str) -> BusResult<T> {
        let value = self.get(name).await?;
        T::from_value(value.coerce(&T::signature())?)
    }

    /// Remote write. The cache changes when the owner announces it.
    pub async fn set(&self, name: &str, value: impl Into<Value>) -> BusResult<()> {
        self.remote.set(name, value).await
    }
}
