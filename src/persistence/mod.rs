//! The `persistence` module is the store adapter the bus is built on.
//!
//! `Store` is the contract (keyed tables with TTLs, history, notify signals,
//! compare-and-set locks); `SledStore` implements it on top of `sled`, an
//! embedded key-value store.

pub mod sled_store;
pub mod store;

pub use sled_store::SledStore;
pub use store::{LockRecord, Store, StoredEntry, StoredValue, Table};
