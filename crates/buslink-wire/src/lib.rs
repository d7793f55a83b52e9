//! buslink wire layer: one shared connection multiplexing many callers.
//!
//! ## Architecture
//!
//! - **Connection**: serialized sends, inbound routing, config ownership
//! - **PendingCalls**: serial → waiting caller, resolved at most once
//! - **ListenerRegistry**: signal subscriptions keyed by [`MatchRule`]
//! - **Transport**: seam to the byte-level link
//! - **MemoryBus**: in-process bus daemon for tests and embedders

pub mod call;
pub mod connection;
pub mod listen;
pub mod memory;
pub mod rule;
pub mod transport;

pub use call::PendingCalls;
pub use connection::{Connection, ListenerGuard, MethodDispatcher};
pub use listen::{dynamic_handler, typed_handler, ListenerHandle, ListenerRegistry, SignalHandler};
pub use memory::{MemoryBus, NameReply};
pub use rule::MatchRule;
pub use transport::Transport;
