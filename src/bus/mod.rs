//! The `bus` module holds what the client and server roles share: the
//! `BusEngine` (encode/decode, receipts) and the connection handle plus the
//! per-dispatch `DeliveryContext` that travels beside a message.

pub mod connection;
pub mod engine;

pub use connection::{Connection, DeliveryContext, PROTOCOL_ERROR_CLOSE_CODE};
pub use engine::BusEngine;

#[cfg(test)]
mod tests;
