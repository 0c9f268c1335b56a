//! Store backed by `sled`
//!
//! Each table is a sled tree. Entry keys are `<key>\x1f<id>` so a prefix scan
//! yields everything stored under one key; entries carry a sequence number
//! from `generate_id` to keep insertion order. Expired entries are dropped
//! lazily whenever a key is read.
//!
//! Lock records use `compare_and_swap`, never read-then-write. Notifications
//! are routed in-process to the sinks registered with `subscribe`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sled::{Db, Tree};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::store::{LockRecord, Store, StoredEntry, StoredValue, Table};
use crate::utils::{BusError, Result};

const KEY_SEPARATOR: char = '\u{1f}';
const LOCKS_TREE: &str = "locks";
const HISTORY_TREE: &str = "history";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    ready: Arc<AtomicBool>,
    subscribers: Arc<Mutex<HashMap<String, UnboundedSender<String>>>>,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self::from_db(db))
    }

    pub fn from_db(db: Db) -> Self {
        Self {
            db,
            ready: Arc::new(AtomicBool::new(true)),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Flushes and marks the store unusable for every clone.
    pub fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.db.flush()?;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(BusError::StoreNotReady)
        }
    }

    fn tree(&self, name: &str) -> Result<Tree> {
        self.ensure_ready()?;
        Ok(self.db.open_tree(name)?)
    }

    fn entry_key(key: &str, id: &str) -> String {
        format!("{key}{KEY_SEPARATOR}{id}")
    }

    fn prefix(key: &str) -> String {
        format!("{key}{KEY_SEPARATOR}")
    }

    /// Reads entries under `prefix`, removing the expired ones on the way.
    fn scan(&self, tree: &Tree, prefix: &str) -> Result<Vec<StoredEntry>> {
        let now = self.time();
        let mut live = Vec::new();
        let mut expired = Vec::new();

        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (raw_key, raw_value) = item?;
            let entry: StoredEntry = match serde_json::from_slice(&raw_value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable store entry: {e}");
                    continue;
                }
            };
            match entry.expires_at {
                Some(expires_at) if expires_at <= now => expired.push(raw_key),
                _ => live.push(entry),
            }
        }

        for raw_key in expired {
            tree.remove(raw_key)?;
        }

        live.sort_by_key(|entry| entry.seq);
        Ok(live)
    }

    fn sink_for(&self, key: &str) -> Option<UnboundedSender<String>> {
        let subscribers = self.subscribers.lock().ok()?;
        subscribers.get(key).cloned()
    }
}

#[async_trait]
impl Store for SledStore {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn time(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn add_values(
        &self,
        table: Table,
        key: &str,
        values: Vec<StoredValue>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let tree = self.tree(table.name())?;
        let expires_at = ttl.map(|ttl| self.time() + ttl.as_millis() as i64);

        for value in values {
            let entry_key = Self::entry_key(key, &value.id);
            // an upsert keeps its original position
            let existing = tree
                .get(entry_key.as_bytes())?
                .and_then(|raw| serde_json::from_slice::<StoredEntry>(&raw).ok());
            let seq = match existing {
                Some(entry) => entry.seq,
                None => self.db.generate_id()?,
            };
            let entry = StoredEntry {
                key: key.to_string(),
                id: value.id,
                content: value.content,
                seq,
                expires_at,
            };
            tree.insert(entry_key.as_bytes(), serde_json::to_vec(&entry)?)?;
        }
        Ok(())
    }

    async fn get_values(&self, table: Table, key: Option<&str>) -> Result<Vec<StoredEntry>> {
        let tree = self.tree(table.name())?;
        let prefix = key.map(Self::prefix).unwrap_or_default();
        self.scan(&tree, &prefix)
    }

    async fn remove_values(
        &self,
        table: Table,
        key: &str,
        ids: Option<&[String]>,
    ) -> Result<Vec<StoredEntry>> {
        let tree = self.tree(table.name())?;
        let entries = self.scan(&tree, &Self::prefix(key))?;

        let mut removed = Vec::new();
        for entry in entries {
            if ids.is_some_and(|ids| !ids.contains(&entry.id)) {
                continue;
            }
            tree.remove(Self::entry_key(key, &entry.id).as_bytes())?;
            removed.push(entry);
        }
        Ok(removed)
    }

    async fn add_history(&self, key: &str, values: Vec<StoredValue>) -> Result<()> {
        let tree = self.tree(HISTORY_TREE)?;
        for value in values {
            let seq = self.db.generate_id()?;
            let entry = StoredEntry {
                key: key.to_string(),
                id: value.id,
                content: value.content,
                seq,
                expires_at: None,
            };
            // sequence first so one id can appear in history more than once
            let entry_key = Self::entry_key(key, &format!("{seq:020}"));
            tree.insert(entry_key.as_bytes(), serde_json::to_vec(&entry)?)?;
        }
        Ok(())
    }

    async fn get_history(&self, key: &str) -> Result<Vec<StoredEntry>> {
        let tree = self.tree(HISTORY_TREE)?;
        self.scan(&tree, &Self::prefix(key))
    }

    fn subscribe(&self, key: &str, sink: UnboundedSender<String>) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(key.to_string(), sink);
        }
    }

    fn unsubscribe(&self, key: &str) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(key);
        }
    }

    async fn notify(&self, key: &str) -> Result<()> {
        self.ensure_ready()?;
        match self.sink_for(key) {
            Some(sink) => {
                if sink.send(key.to_string()).is_err() {
                    debug!("Notify sink for {key} is closed; dropping subscription");
                    self.unsubscribe(key);
                }
            }
            None => debug!("No subscriber for {key}"),
        }
        Ok(())
    }

    async fn lock(&self, lock_id: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let tree = self.tree(LOCKS_TREE)?;
        let now = self.time();
        let current = tree.get(lock_id.as_bytes())?;

        if let Some(raw) = &current {
            if let Ok(record) = serde_json::from_slice::<LockRecord>(raw) {
                if record.expires_at > now {
                    return Ok(false);
                }
            }
        }

        let record = LockRecord {
            lock_id: lock_id.to_string(),
            holder_id: holder.to_string(),
            expires_at: now + ttl.as_millis() as i64,
        };
        let swapped =
            tree.compare_and_swap(lock_id.as_bytes(), current, Some(serde_json::to_vec(&record)?))?;
        Ok(swapped.is_ok())
    }

    async fn unlock(&self, lock_id: &str, holder: &str) -> Result<bool> {
        let tree = self.tree(LOCKS_TREE)?;
        let Some(current) = tree.get(lock_id.as_bytes())? else {
            return Ok(false);
        };
        let record: LockRecord = serde_json::from_slice(&current)?;
        if record.holder_id != holder {
            return Ok(false);
        }
        let swapped = tree.compare_and_swap(lock_id.as_bytes(), Some(current), None::<Vec<u8>>)?;
        Ok(swapped.is_ok())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("ready", &self.is_ready())
            .finish()
    }
}
