use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::bus::DeliveryContext;
use crate::database::BusDatabase;
use crate::message::{BusMessage, LockAction, LockResponse, LockResult, MessageBody};
use crate::server::NegotiationHandler;
use crate::utils::{BusError, Result};

/// Answers `RequestLock` for clients connected to this broker, using the lock
/// table of the shared store as the single source of truth.
#[derive(Debug, Clone)]
pub struct LockAuthority {
    database: BusDatabase,
}

impl LockAuthority {
    pub fn new(database: BusDatabase) -> Self {
        Self { database }
    }
}

#[async_trait]
impl NegotiationHandler for LockAuthority {
    async fn handle(&self, message: &BusMessage, context: &mut DeliveryContext) -> Result<()> {
        let MessageBody::RequestLock(request) = message.body() else {
            return Err(BusError::negotiation(format!(
                "lock authority cannot answer {}",
                message.kind()
            )));
        };
        let holder = message
            .client_id
            .as_deref()
            .ok_or_else(|| BusError::negotiation("lock request without a client id"))?;

        let result = match request.action {
            LockAction::Acquire => {
                let ttl = Duration::from_millis(request.release_timeout_ms);
                match self.database.acquire_lock(&request.lock_id, holder, ttl).await {
                    Ok(true) => LockResult::Locked,
                    Ok(false) => LockResult::Cannot,
                    Err(e) => {
                        warn!("Acquiring {} for {holder} failed: {e}", request.lock_id);
                        LockResult::Fail
                    }
                }
            }
            LockAction::Release => match self.database.release_lock(&request.lock_id, holder).await {
                Ok(true) => LockResult::Released,
                Ok(false) => LockResult::Fail,
                Err(e) => {
                    warn!("Releasing {} for {holder} failed: {e}", request.lock_id);
                    LockResult::Fail
                }
            },
        };
        info!("{holder} {:?} {}: {result:?}", request.action, request.lock_id);

        let mut response = BusMessage::lock_response(LockResponse {
            lock_id: request.lock_id.clone(),
            request_id: request.request_id.clone(),
            result,
        });
        response.client_id = message.client_id.clone();
        context.respond(response);
        Ok(())
    }
}
