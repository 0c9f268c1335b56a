//! Bus database
//!
//! Domain operations over a `Store`: channel membership, per-client message
//! queues, delivery history and locks. Operations that must not run twice
//! when several brokers share one store go through `lock_and_execute`, so a
//! replica that loses the race treats the operation as already handled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BusSettings;
use crate::lock::LockId;
use crate::message::BusMessage;
use crate::persistence::{Store, StoredEntry, StoredValue, Table};
use crate::utils::{BusError, Result};

const DEDUP_LOCK_PREFIX: &str = "dedup:";
const CLIENT_LOCK_PREFIX: &str = "client:";

/// A channel membership record, stored under the channel name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub client_id: String,
    pub server_id: String,
    pub joined_at: i64,
}

#[derive(Clone)]
pub struct BusDatabase {
    store: Arc<dyn Store>,
    server_id: String,
    membership_ttl: Duration,
    dedup_window: Duration,
}

impl BusDatabase {
    pub fn new(store: Arc<dyn Store>, server_id: impl Into<String>, settings: &BusSettings) -> Self {
        Self {
            store,
            server_id: server_id.into(),
            membership_ttl: Duration::from_secs(settings.membership_ttl_secs),
            dedup_window: Duration::from_millis(settings.dedup_window_ms),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.store.is_ready() {
            Ok(())
        } else {
            Err(BusError::StoreNotReady)
        }
    }

    /// Runs `operation` only if this broker wins the store lock derived from
    /// `lock`. Returns whether it ran. A failed operation releases the lock so
    /// another replica may retry it; a successful one keeps it for the dedup
    /// window.
    pub async fn lock_and_execute<F, Fut>(&self, lock: &LockId, operation: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        Ok(self.run_locked(lock, true, operation).await?.is_some())
    }

    /// Like `lock_and_execute`, but the lock is released as soon as
    /// `operation` finishes, so the same operation may run again right away.
    /// `None` means another broker was running it at the same moment.
    pub async fn exclusive<T, F, Fut>(&self, lock: &LockId, operation: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_locked(lock, false, operation).await
    }

    async fn run_locked<T, F, Fut>(&self, lock: &LockId, keep: bool, operation: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_ready()?;
        let key = format!("{DEDUP_LOCK_PREFIX}{lock}");

        if !self.store.lock(&key, &self.server_id, self.dedup_window).await? {
            debug!("Operation {lock} already handled by another broker");
            return Ok(None);
        }

        let outcome = operation().await;
        if outcome.is_err() || !keep {
            if let Err(unlock_err) = self.store.unlock(&key, &self.server_id).await {
                warn!("Failed to release lock {lock}: {unlock_err}");
            }
        }
        outcome.map(Some)
    }

    pub async fn join(&self, channel: &str, client_id: &str) -> Result<()> {
        let lock = LockId::builder()
            .with("join")
            .with(channel)
            .with(client_id)
            .build();

        self.lock_and_execute(&lock, || self.upsert_member(channel, client_id, None))
            .await?;
        info!("Recorded {client_id} as member of {channel}");
        Ok(())
    }

    /// Refreshes the membership TTL for one Ping. Re-creates the record if it
    /// already expired.
    pub async fn touch(&self, channel: &str, client_id: &str, ping_id: &str) -> Result<()> {
        let lock = LockId::builder()
            .with("touch")
            .with(channel)
            .with(client_id)
            .with(ping_id)
            .build();

        self.exclusive(&lock, || async {
            let existing = self
                .store
                .get_values(Table::Channels, Some(channel))
                .await?
                .into_iter()
                .find(|entry| entry.id == client_id);
            self.upsert_member(channel, client_id, existing).await
        })
        .await?;
        Ok(())
    }

    async fn upsert_member(
        &self,
        channel: &str,
        client_id: &str,
        existing: Option<StoredEntry>,
    ) -> Result<()> {
        let content = match existing {
            Some(entry) => entry.content,
            None => serde_json::to_string(&ChannelMember {
                client_id: client_id.to_string(),
                server_id: self.server_id.clone(),
                joined_at: self.store.time(),
            })?,
        };
        self.store
            .add_values(
                Table::Channels,
                channel,
                vec![StoredValue::new(client_id, content)],
                Some(self.membership_ttl),
            )
            .await
    }

    /// Removes the membership and everything still queued for the client.
    pub async fn leave(&self, channel: &str, client_id: &str) -> Result<()> {
        let lock = LockId::builder()
            .with("leave")
            .with(channel)
            .with(client_id)
            .build();

        self.lock_and_execute(&lock, || async {
            let ids = [client_id.to_string()];
            self.store
                .remove_values(Table::Channels, channel, Some(&ids[..]))
                .await?;
            let dropped = self
                .store
                .remove_values(Table::Messages, client_id, None)
                .await?;
            if !dropped.is_empty() {
                debug!("Dropped {} undelivered messages for {client_id}", dropped.len());
            }
            Ok::<(), BusError>(())
        })
        .await?;
        Ok(())
    }

    /// Members of `channel`, or of every channel when `None`.
    pub async fn members(&self, channel: Option<&str>) -> Result<Vec<ChannelMember>> {
        self.ensure_ready()?;
        let entries = self.store.get_values(Table::Channels, channel).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_str(&entry.content).ok())
            .collect())
    }

    /// Client ids a message fans out to, in first-seen order, sender excluded.
    pub async fn recipients(&self, message: &BusMessage) -> Result<Vec<String>> {
        let members = if message.is_wildcard() {
            self.members(None).await?
        } else {
            let mut members = Vec::new();
            for channel in message.channels() {
                members.extend(self.members(Some(channel.as_str())).await?);
            }
            members
        };

        let mut recipients: Vec<String> = Vec::new();
        for member in members {
            if message.client_id.as_deref() == Some(member.client_id.as_str()) {
                continue;
            }
            if !recipients.contains(&member.client_id) {
                recipients.push(member.client_id);
            }
        }
        Ok(recipients)
    }

    /// Queues `message` for every recipient and wakes their dispatchers.
    /// Returns whether anyone was addressed.
    pub async fn post(&self, message: &BusMessage) -> Result<bool> {
        let recipients = self.recipients(message).await?;
        if recipients.is_empty() {
            debug!("No recipients for message {}", message.id());
            return Ok(false);
        }

        let lock = LockId::builder().with("post").with(message.id()).build();
        let content = message.to_value().to_string();

        let queued = self
            .lock_and_execute(&lock, || async {
                for client_id in &recipients {
                    self.store
                        .add_values(
                            Table::Messages,
                            client_id,
                            vec![StoredValue::new(message.id(), content.clone())],
                            Some(self.membership_ttl),
                        )
                        .await?;
                    self.store.notify(client_id).await?;
                }
                Ok::<(), BusError>(())
            })
            .await?;

        if queued {
            debug!(
                "Queued message {} for {} recipients",
                message.id(),
                recipients.len()
            );
        }
        Ok(true)
    }

    pub async fn queued(&self, client_id: &str) -> Result<Vec<StoredEntry>> {
        self.ensure_ready()?;
        self.store.get_values(Table::Messages, Some(client_id)).await
    }

    /// Removes and returns the client's queue in arrival order.
    pub async fn take_messages(&self, client_id: &str) -> Result<Vec<StoredValue>> {
        let lock = LockId::builder().with("take").with(client_id).build();
        let entries = self
            .exclusive(&lock, || {
                self.store.remove_values(Table::Messages, client_id, None)
            })
            .await?
            .unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|entry| StoredValue::new(entry.id, entry.content))
            .collect())
    }

    /// Puts taken but unsent values back on the client's queue. No notify is
    /// raised; the next post or join drains them.
    pub async fn requeue(&self, client_id: &str, values: Vec<StoredValue>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut builder = LockId::builder().with("requeue").with(client_id);
        for value in &values {
            builder = builder.with(&value.id);
        }
        let lock = builder.build();

        let count = values.len();
        self.exclusive(&lock, || {
            self.store
                .add_values(Table::Messages, client_id, values, Some(self.membership_ttl))
        })
        .await?;
        debug!("Requeued {count} messages for {client_id}");
        Ok(())
    }

    pub async fn record_history(&self, client_id: &str, values: Vec<StoredValue>) -> Result<()> {
        self.ensure_ready()?;
        if values.is_empty() {
            return Ok(());
        }
        self.store.add_history(client_id, values).await
    }

    pub async fn history(&self, client_id: &str) -> Result<Vec<StoredEntry>> {
        self.ensure_ready()?;
        self.store.get_history(client_id).await
    }

    /// Client-requested locks live in their own keyspace, apart from the
    /// broker's dedup locks.
    pub async fn acquire_lock(&self, lock_id: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.ensure_ready()?;
        self.store
            .lock(&format!("{CLIENT_LOCK_PREFIX}{lock_id}"), holder, ttl)
            .await
    }

    pub async fn release_lock(&self, lock_id: &str, holder: &str) -> Result<bool> {
        self.ensure_ready()?;
        self.store
            .unlock(&format!("{CLIENT_LOCK_PREFIX}{lock_id}"), holder)
            .await
    }
}

impl std::fmt::Debug for BusDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusDatabase")
            .field("server_id", &self.server_id)
            .field("membership_ttl", &self.membership_ttl)
            .field("dedup_window", &self.dedup_window)
            .finish()
    }
}
