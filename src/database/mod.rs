//! The `database` module is the bus's domain layer over the shared store.

pub mod bus_database;

pub use bus_database::{BusDatabase, ChannelMember};

#[cfg(test)]
mod tests;
