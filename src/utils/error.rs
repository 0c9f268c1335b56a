//! The `error` module defines the error taxonomy shared by every layer of the bus.
//!
//! Negotiation failures are fatal to a connection, store failures surface to
//! the caller of the `BusDatabase`, and malformed frames never reach this type
//! at all: decoding yields `None` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// A Join/Ping (or a message sent before joining) violated the connection protocol.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("store is not ready")]
    StoreNotReady,

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A local operation could not be started, e.g. a duplicate lock request.
    #[error("execution error: {0}")]
    Execution(String),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl BusError {
    pub fn negotiation(reason: impl Into<String>) -> Self {
        BusError::Negotiation(reason.into())
    }

    pub fn execution(reason: impl Into<String>) -> Self {
        BusError::Execution(reason.into())
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(self, BusError::Negotiation(_))
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
