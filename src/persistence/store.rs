//! The store contract the bus is written against.
//!
//! Any backend with keyed values, TTLs, a compare-and-set primitive and a
//! notify signal can sit behind this trait. `SledStore` is the bundled one.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::utils::Result;

/// Logical value tables. Lock records live apart, behind `lock`/`unlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Channels,
    Messages,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Channels => "channels",
            Table::Messages => "messages",
        }
    }
}

/// A value as handed to the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub id: String,
    pub content: String,
}

impl StoredValue {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

/// A value as read back, with its key and bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub key: String,
    pub id: String,
    pub content: String,
    /// Insertion order within the store; entries are returned sorted by it.
    pub seq: u64,
    pub expires_at: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub lock_id: String,
    pub holder_id: String,
    pub expires_at: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// False before opening and after closing; every other call then fails.
    fn is_ready(&self) -> bool;

    /// Store clock in milliseconds since the epoch.
    fn time(&self) -> i64;

    /// Upserts `values` under `key`, keyed by value id. `ttl` (re)sets expiry.
    async fn add_values(
        &self,
        table: Table,
        key: &str,
        values: Vec<StoredValue>,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Live entries under `key`, or under every key when `key` is `None`.
    async fn get_values(&self, table: Table, key: Option<&str>) -> Result<Vec<StoredEntry>>;

    /// Removes the given ids under `key` (all of them when `ids` is `None`)
    /// and returns what was removed.
    async fn remove_values(
        &self,
        table: Table,
        key: &str,
        ids: Option<&[String]>,
    ) -> Result<Vec<StoredEntry>>;

    async fn add_history(&self, key: &str, values: Vec<StoredValue>) -> Result<()>;

    async fn get_history(&self, key: &str) -> Result<Vec<StoredEntry>>;

    /// Routes `notify(key)` signals into `sink`. One sink per key.
    fn subscribe(&self, key: &str, sink: UnboundedSender<String>);

    fn unsubscribe(&self, key: &str);

    async fn notify(&self, key: &str) -> Result<()>;

    /// Atomically takes `lock_id` for `holder` unless someone holds it unexpired.
    async fn lock(&self, lock_id: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Releases `lock_id` if `holder` holds it.
    async fn unlock(&self, lock_id: &str, holder: &str) -> Result<bool>;
}
