use crate::message::{BusMessage, MessageBody, MessageRegistry, MessageType};
use crate::utils::Result;

/// Protocol logic shared by the client and the server: wire encoding, the
/// message type registry, and delivery receipts.
#[derive(Debug, Clone, Default)]
pub struct BusEngine {
    registry: MessageRegistry,
}

impl BusEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: MessageRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Extends the vocabulary this engine understands.
    pub fn attach(&mut self, message_type: MessageType) -> Result<()> {
        self.registry.attach(message_type)
    }

    pub fn decode(&self, text: &str) -> Option<BusMessage> {
        self.registry.decode(text)
    }

    /// Wire text for `message`. Cannot fail: the JSON object is assembled
    /// directly from owned strings and numbers.
    pub fn encode(&self, message: &BusMessage) -> String {
        message.to_value().to_string()
    }

    /// Wraps `original` so its sender learns whether anyone received it.
    pub fn receipt_for(&self, original: &BusMessage, delivered: bool) -> BusMessage {
        let mut inner = original.clone();
        inner.delivered = delivered;

        let mut receipt = BusMessage::new(
            original.channels().to_vec(),
            MessageBody::DeliveryReceipt {
                message: inner.to_value(),
            },
        );
        receipt.delivered = delivered;
        receipt.client_id = original.client_id.clone();
        receipt
    }

    /// The original carried by a receipt, with the receipt's delivery state.
    pub fn unwrap_receipt(&self, receipt: &BusMessage) -> Option<BusMessage> {
        let MessageBody::DeliveryReceipt { message } = receipt.body() else {
            return None;
        };
        let mut original = self.registry.decode_value(message.clone())?;
        original.delivered = receipt.delivered;
        Some(original)
    }
}
