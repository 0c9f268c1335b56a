//! Client-side lock requests.
//!
//! Each request goes out as a `RequestLock` negotiation message and waits for
//! the matching `LockResponse` on the client's event stream, bounded by a
//! timer. At most one request per lock id is outstanding at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::LockId;
use crate::client::BusClient;
use crate::message::{BusMessage, LockAction, LockResponse, LockResult, MessageBody, RequestLock};
use crate::utils::{BusError, Result};

struct PendingRequest {
    request_id: String,
    resolver: oneshot::Sender<LockResult>,
}

pub struct LockService {
    client: Arc<BusClient>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl LockService {
    pub fn new(client: Arc<BusClient>) -> Self {
        Self {
            client,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Routes `LockResponse` events from the client to waiting requests.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.client.subscribe();
        let service: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let message = match events.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Lock listener lagged, {skipped} events skipped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(service) = service.upgrade() else {
                    break;
                };
                if let MessageBody::LockResponse(response) = message.body() {
                    service.resolve(response);
                }
            }
            debug!("Lock listener stopped");
        })
    }

    /// Asks the broker for `lock`, held at most `release_timeout` once granted.
    /// Resolves to `Timeout` when no answer arrives within `acquire_timeout`.
    pub async fn acquire(
        &self,
        lock: &LockId,
        acquire_timeout: Duration,
        release_timeout: Duration,
    ) -> Result<LockResult> {
        self.request(lock, LockAction::Acquire, release_timeout, acquire_timeout)
            .await
    }

    pub async fn release(&self, lock: &LockId, timeout: Duration) -> Result<LockResult> {
        self.request(lock, LockAction::Release, Duration::ZERO, timeout)
            .await
    }

    async fn request(
        &self,
        lock: &LockId,
        action: LockAction,
        release_timeout: Duration,
        timeout: Duration,
    ) -> Result<LockResult> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (resolver, response) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| BusError::execution("lock request table poisoned"))?;
            if pending.contains_key(lock.as_str()) {
                return Err(BusError::execution(format!(
                    "a request for lock {lock} is already outstanding"
                )));
            }
            pending.insert(
                lock.as_str().to_string(),
                PendingRequest {
                    request_id: request_id.clone(),
                    resolver,
                },
            );
        }

        let message = BusMessage::request_lock(RequestLock {
            lock_id: lock.as_str().to_string(),
            request_id: request_id.clone(),
            action,
            release_timeout_ms: u64::try_from(release_timeout.as_millis()).unwrap_or(u64::MAX),
        });
        if !self.client.send(message) {
            debug!("Lock request {request_id} not sent; waiting out the timeout");
        }

        let result = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => LockResult::Fail,
            Err(_) => {
                warn!("Lock request {request_id} for {lock} timed out after {timeout:?}");
                LockResult::Timeout
            }
        };

        self.forget(lock, &request_id);
        Ok(result)
    }

    /// Completes the request a response answers. Returns `false` for stale or
    /// unknown responses.
    pub fn resolve(&self, response: &LockResponse) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        let matches = pending
            .get(&response.lock_id)
            .is_some_and(|p| p.request_id == response.request_id);
        if !matches {
            debug!(
                "Ignoring response {} for lock {}",
                response.request_id, response.lock_id
            );
            return false;
        }

        match pending.remove(&response.lock_id) {
            Some(request) => request.resolver.send(response.result).is_ok(),
            None => false,
        }
    }

    fn forget(&self, lock: &LockId, request_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            if pending
                .get(lock.as_str())
                .is_some_and(|p| p.request_id == request_id)
            {
                pending.remove(lock.as_str());
            }
        }
    }

    /// Lock ids with a request in flight.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService")
            .field("client", &self.client)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
