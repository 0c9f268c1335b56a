//! The `client` module is the client side of the bus.
//!
//! A `BusClient` owns one logical connection to a broker: it joins its
//! channel on every (re)connect, heartbeats with Pings and turns inbound
//! frames into local events.

pub mod bus_client;
pub use bus_client::BusClient;
