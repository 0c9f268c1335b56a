//! # Busline
//!
//! `busline` is a channel-based message bus over WebSockets. Clients join one
//! channel, exchange messages with other clients through a broker, and get a
//! delivery receipt for everything they send. Brokers keep no routing state
//! of their own: membership, queues and locks live in a shared store, so
//! several brokers can serve one bus.
//!
//! ## Core Modules
//!
//! - `message`: the message envelope, its built-in types and the runtime type registry.
//! - `persistence`: the `Store` contract and its `sled` implementation.
//! - `database`: membership, queues, history and deduplicated operations over a `Store`.
//! - `bus`: protocol logic shared by both roles (encoding, receipts, connections).
//! - `server`: the broker: negotiation, fan-out, dispatch and the WebSocket accept loop.
//! - `client`: the client role: join, heartbeat, reconnect and local events.
//! - `lock`: distributed locks requested over the bus.
//! - `config`: configuration loading.
//! - `utils`: error types and logging setup.

pub mod bus;
pub mod client;
pub mod config;
pub mod database;
pub mod lock;
pub mod message;
pub mod persistence;
pub mod server;
pub mod utils;

#[cfg(test)]
mod tests;
