//! The `lock` module provides distributed locks on top of the bus.
//!
//! - `LockId` / `LockIdBuilder`: content-addressed lock identities, also used
//!   by the `BusDatabase` to deduplicate broker-side operations.
//! - `LockService`: client side, request/response over negotiation messages.
//! - `LockAuthority`: server side handler for `RequestLock`.

pub mod authority;
pub mod lock_id;
pub mod service;

pub use authority::LockAuthority;
pub use lock_id::{LockId, LockIdBuilder};
pub use service::LockService;
