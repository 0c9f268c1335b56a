//! The `server` module is the broker side of the bus: per-connection
//! negotiation, fan-out through the `BusDatabase`, dispatch of queued
//! messages, and the WebSocket accept loop.

pub mod bus_server;
pub mod handler;
pub mod websocket;

pub use bus_server::{BusServer, ClientConnectionState, Session, is_valid_channel_name};
pub use handler::NegotiationHandler;
pub use websocket::{serve, start_websocket_server};
