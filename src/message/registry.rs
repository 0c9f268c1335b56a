//! Message type registry.
//!
//! Each registered type pairs a discriminant (`type` tag) with a category and a
//! structural validator. Decoding walks the types in registration order and
//! takes the first whose tag matches and whose validator accepts the object.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::envelope::{
    BusMessage, Category, ENVELOPE_KEYS, Envelope, LockResponse, MessageBody, RequestLock,
};
use crate::utils::{BusError, Result};

pub type Validator = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// JSON shape a required field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }
}

#[derive(Clone)]
enum Shape {
    Builtin(fn(Map<String, Value>) -> Option<MessageBody>),
    Custom,
}

#[derive(Clone)]
pub struct MessageType {
    kind: String,
    category: Category,
    validator: Validator,
    shape: Shape,
}

impl MessageType {
    /// A runtime type with an arbitrary validator over the whole frame.
    pub fn new(
        kind: impl Into<String>,
        category: Category,
        validator: impl Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            category,
            validator: Arc::new(validator),
            shape: Shape::Custom,
        }
    }

    /// A runtime type whose frames must carry `fields` with the given shapes.
    pub fn with_fields(
        kind: impl Into<String>,
        category: Category,
        fields: &[(&str, FieldKind)],
    ) -> Self {
        let required: Vec<(String, FieldKind)> = fields
            .iter()
            .map(|(name, kind)| (name.to_string(), *kind))
            .collect();
        Self::new(kind, category, move |map| has_fields(map, &required))
    }

    fn builtin(
        kind: &str,
        category: Category,
        fields: &[(&str, FieldKind)],
        build: fn(Map<String, Value>) -> Option<MessageBody>,
    ) -> Self {
        let mut message_type = Self::with_fields(kind, category, fields);
        message_type.shape = Shape::Builtin(build);
        message_type
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn accepts(&self, tag: &str, map: &Map<String, Value>) -> bool {
        self.kind == tag && (self.validator)(map)
    }

    fn build(&self, fields: Map<String, Value>) -> Option<MessageBody> {
        match self.shape {
            Shape::Builtin(build) => build(fields),
            Shape::Custom => Some(MessageBody::Custom {
                kind: self.kind.clone(),
                category: self.category,
                fields,
            }),
        }
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("kind", &self.kind)
            .field("category", &self.category)
            .finish()
    }
}

fn has_fields(map: &Map<String, Value>, required: &[(String, FieldKind)]) -> bool {
    required
        .iter()
        .all(|(name, kind)| map.get(name).is_some_and(|v| kind.matches(v)))
}

/// The ordered set of message types one engine understands.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    types: Vec<MessageType>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MessageRegistry {
    pub fn empty() -> Self {
        Self { types: Vec::new() }
    }

    pub fn with_builtins() -> Self {
        use FieldKind as F;

        let mut registry = Self::empty();
        registry.types = vec![
            MessageType::builtin("Join", Category::Negotiation, &[], |_| {
                Some(MessageBody::Join)
            }),
            MessageType::builtin("Ping", Category::Negotiation, &[], |_| {
                Some(MessageBody::Ping)
            }),
            MessageType::builtin(
                "RequestLock",
                Category::Negotiation,
                &[
                    ("lockId", F::String),
                    ("requestId", F::String),
                    ("action", F::String),
                    ("releaseTimeoutMs", F::Number),
                ],
                |fields| {
                    serde_json::from_value::<RequestLock>(Value::Object(fields))
                        .ok()
                        .map(MessageBody::RequestLock)
                },
            ),
            MessageType::builtin(
                "LockResponse",
                Category::Negotiation,
                &[
                    ("lockId", F::String),
                    ("requestId", F::String),
                    ("result", F::String),
                ],
                |fields| {
                    serde_json::from_value::<LockResponse>(Value::Object(fields))
                        .ok()
                        .map(MessageBody::LockResponse)
                },
            ),
            MessageType::builtin(
                "Text",
                Category::Communication,
                &[("text", F::String)],
                |mut fields| match fields.remove("text") {
                    Some(Value::String(text)) => Some(MessageBody::Text { text }),
                    _ => None,
                },
            ),
            MessageType::builtin(
                "DeliveryReceipt",
                Category::Communication,
                &[("message", F::Object)],
                |mut fields| {
                    fields
                        .remove("message")
                        .map(|message| MessageBody::DeliveryReceipt { message })
                },
            ),
        ];
        registry
    }

    /// Registers a new type. Kinds are unique within a registry.
    pub fn attach(&mut self, message_type: MessageType) -> Result<()> {
        if self.lookup(&message_type.kind).is_some() {
            return Err(BusError::execution(format!(
                "message type '{}' is already registered",
                message_type.kind
            )));
        }
        self.types.push(message_type);
        Ok(())
    }

    pub fn lookup(&self, kind: &str) -> Option<&MessageType> {
        self.types.iter().find(|t| t.kind == kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|t| t.kind.as_str())
    }

    /// Decodes a wire frame. Anything unparseable or unrecognized is `None`.
    pub fn decode(&self, text: &str) -> Option<BusMessage> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.decode_value(value),
            Err(e) => {
                debug!("Dropping non-JSON frame: {e}");
                None
            }
        }
    }

    pub fn decode_value(&self, value: Value) -> Option<BusMessage> {
        let Value::Object(mut map) = value else {
            debug!("Dropping frame that is not a JSON object");
            return None;
        };

        let envelope: Envelope = match serde_json::from_value(Value::Object(map.clone())) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping frame with malformed envelope: {e}");
                return None;
            }
        };

        let Some(message_type) = self
            .types
            .iter()
            .find(|t| t.accepts(&envelope.kind, &map))
        else {
            debug!("No registered type accepts frame of type '{}'", envelope.kind);
            return None;
        };

        for key in ENVELOPE_KEYS {
            map.remove(key);
        }
        let body = message_type.build(map)?;

        Some(BusMessage::from_parts(
            envelope.id,
            envelope.channels,
            envelope.client_id,
            envelope.timestamp,
            envelope.delivered,
            body,
        ))
    }
}
