//! Transport seam.
//!
//! A transport encodes and writes outbound messages. Inbound messages are
//! handed to [`Connection::dispatch`](crate::Connection::dispatch) one at a
//! time by whatever reads the socket.

use async_trait::async_trait;
use buslink_types::{BusResult, Message};

/// Outbound half of a bus link.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one message. The caller serializes calls to `send`.
    async fn send(&self, msg: Message) -> BusResult<()>;

    /// Unique name the bus assigned to this link.
    fn unique_name(&self) -> &str;
}
