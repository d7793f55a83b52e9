//! Call correlation.
//!
//! Every outstanding method call owns one slot in [`PendingCalls`], keyed by
//! its serial. The first reply, error or timeout removes the slot; anything
//! arriving for a serial that is no longer present is dropped.

use buslink_types::{BusError, BusResult, Message};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Table of in-flight calls.
pub struct PendingCalls {
    slots: DashMap<u32, oneshot::Sender<Message>>,
    next: AtomicU32,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next: AtomicU32::new(1),
        }
    }

    /// Allocate a serial that is non-zero and not held by an in-flight call.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next.fetch_add(1, Ordering::Relaxed);
            if serial != 0 && !self.slots.contains_key(&serial) {
                return serial;
            }
        }
    }

    /// Open a slot for `serial`.
    pub fn register(&self, serial: u32) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(serial, tx);
        rx
    }

    /// Close a slot without resolving it (the send failed).
    pub fn cancel(&self, serial: u32) {
        self.slots.remove(&serial);
    }

    /// Route a reply or error to its caller. Returns false for stale replies.
    pub fn resolve(&self, reply: Message) -> bool {
        let Some(serial) = reply.reply_serial else {
            debug!("Reply without reply serial dropped");
            return false;
        };
        match self.slots.remove(&serial) {
            Some((_, tx)) => {
                // The caller may have gone away between remove and send.
                if tx.send(reply).is_err() {
                    debug!(serial, "Caller gone before reply delivery");
                }
                true
            }
            None => {
                debug!(serial, "Dropping reply for unknown or expired call");
                false
            }
        }
    }

    /// Wait for the slot to resolve or for `timeout` to pass.
    pub async fn wait(
        &self,
        serial: u32,
        rx: oneshot::Receiver<Message>,
        timeout: Duration,
    ) -> BusResult<Message> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Transport(
                "connection closed before reply".to_string(),
            )),
            Err(_) => {
                self.slots.remove(&serial);
                warn!(serial, timeout_ms = timeout.as_millis() as u64, "Call timed out");
                Err(BusError::Timeout(timeout))
            }
        }
    }

    /// Number of calls still waiting.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
