//! The `message` module defines everything that travels on the bus.
//!
//! A `BusMessage` is an envelope (id, channels, sender, delivery state) around
//! a `MessageBody`. Bodies fall into two disjoint categories: negotiation
//! (client/server control such as Join and Ping) and communication (payloads
//! routed through per-client queues). The `MessageRegistry` turns wire JSON
//! back into typed messages and can be extended with new types at runtime.

pub mod envelope;
pub mod registry;

pub use envelope::{
    BusMessage, Category, LockAction, LockResponse, LockResult, MessageBody, RequestLock,
    WILDCARD_CHANNEL, content_id,
};
pub use registry::{FieldKind, MessageRegistry, MessageType, Validator};
