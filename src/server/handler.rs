use async_trait::async_trait;

use crate::bus::DeliveryContext;
use crate::message::BusMessage;
use crate::utils::Result;

/// Server-side handler for a negotiation type beyond Join and Ping.
///
/// Handlers run only for joined connections whose client id matches the
/// message. A handler answers by calling `context.respond`; returning
/// `BusError::Negotiation` closes the connection.
#[async_trait]
pub trait NegotiationHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage, context: &mut DeliveryContext) -> Result<()>;
}
