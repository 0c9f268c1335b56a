use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// The channel name that addresses every joined client.
pub const WILDCARD_CHANNEL: &str = "*";

/// Envelope keys every frame carries, regardless of its type.
pub(crate) const ENVELOPE_KEYS: [&str; 6] =
    ["id", "type", "channels", "clientId", "delivered", "timestamp"];

/// Which side of the bus a message type travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Client and server only, answered directly, never persisted.
    Negotiation,
    /// Client to client, queued in the store for every recipient.
    Communication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockAction {
    Acquire,
    Release,
}

impl LockAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LockAction::Acquire => "acquire",
            LockAction::Release => "release",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockResult {
    Locked,
    Cannot,
    Released,
    Fail,
    /// Produced locally when no response arrives in time; never sent by a broker.
    Timeout,
}

impl LockResult {
    pub fn as_str(self) -> &'static str {
        match self {
            LockResult::Locked => "Locked",
            LockResult::Cannot => "Cannot",
            LockResult::Released => "Released",
            LockResult::Fail => "Fail",
            LockResult::Timeout => "Timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLock {
    pub lock_id: String,
    pub request_id: String,
    pub action: LockAction,
    pub release_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub lock_id: String,
    pub request_id: String,
    pub result: LockResult,
}

/// Type-specific part of a `BusMessage`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Join,
    Ping,
    RequestLock(RequestLock),
    LockResponse(LockResponse),
    Text {
        text: String,
    },
    /// Server to client only. `message` is the encoded original, kept as raw
    /// JSON so the receiving engine decodes it with its own registry.
    DeliveryReceipt {
        message: Value,
    },
    /// A type attached to a registry at runtime.
    Custom {
        kind: String,
        category: Category,
        fields: Map<String, Value>,
    },
}

impl MessageBody {
    pub fn kind(&self) -> &str {
        match self {
            MessageBody::Join => "Join",
            MessageBody::Ping => "Ping",
            MessageBody::RequestLock(_) => "RequestLock",
            MessageBody::LockResponse(_) => "LockResponse",
            MessageBody::Text { .. } => "Text",
            MessageBody::DeliveryReceipt { .. } => "DeliveryReceipt",
            MessageBody::Custom { kind, .. } => kind,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            MessageBody::Join
            | MessageBody::Ping
            | MessageBody::RequestLock(_)
            | MessageBody::LockResponse(_) => Category::Negotiation,
            MessageBody::Text { .. } | MessageBody::DeliveryReceipt { .. } => {
                Category::Communication
            }
            MessageBody::Custom { category, .. } => *category,
        }
    }

    /// Type-specific wire fields. Built by hand so encoding cannot fail; the
    /// names match the serde derives used for decoding.
    pub(crate) fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            MessageBody::Join | MessageBody::Ping => {}
            MessageBody::RequestLock(request) => {
                map.insert("lockId".into(), Value::from(request.lock_id.as_str()));
                map.insert("requestId".into(), Value::from(request.request_id.as_str()));
                map.insert("action".into(), Value::from(request.action.as_str()));
                map.insert(
                    "releaseTimeoutMs".into(),
                    Value::from(request.release_timeout_ms),
                );
            }
            MessageBody::LockResponse(response) => {
                map.insert("lockId".into(), Value::from(response.lock_id.as_str()));
                map.insert("requestId".into(), Value::from(response.request_id.as_str()));
                map.insert("result".into(), Value::from(response.result.as_str()));
            }
            MessageBody::Text { text } => {
                map.insert("text".into(), Value::from(text.as_str()));
            }
            MessageBody::DeliveryReceipt { message } => {
                map.insert("message".into(), message.clone());
            }
            MessageBody::Custom { fields, .. } => return fields.clone(),
        }
        map
    }
}

/// The envelope for everything traveling on the bus.
///
/// `id` and `channels` are fixed at construction. A decoded message keeps the
/// id it carried on the wire, so re-decoding an encoded message yields an
/// equal id.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    id: String,
    channels: Vec<String>,
    pub client_id: Option<String>,
    pub timestamp: i64,
    pub delivered: bool,
    body: MessageBody,
}

impl BusMessage {
    pub fn new(channels: Vec<String>, body: MessageBody) -> Self {
        let salt = uuid::Uuid::new_v4().to_string();
        let id = content_id(body.kind(), &channels, &body.fields(), &salt);
        Self {
            id,
            channels,
            client_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            delivered: false,
            body,
        }
    }

    pub fn join(channel: impl Into<String>) -> Self {
        Self::new(vec![channel.into()], MessageBody::Join)
    }

    pub fn ping() -> Self {
        Self::new(Vec::new(), MessageBody::Ping)
    }

    pub fn text(channels: Vec<String>, text: impl Into<String>) -> Self {
        Self::new(channels, MessageBody::Text { text: text.into() })
    }

    /// A text broadcast to every joined client.
    pub fn broadcast(text: impl Into<String>) -> Self {
        Self::text(vec![WILDCARD_CHANNEL.to_string()], text)
    }

    pub fn request_lock(request: RequestLock) -> Self {
        Self::new(Vec::new(), MessageBody::RequestLock(request))
    }

    pub fn lock_response(response: LockResponse) -> Self {
        Self::new(Vec::new(), MessageBody::LockResponse(response))
    }

    pub(crate) fn from_parts(
        id: String,
        channels: Vec<String>,
        client_id: Option<String>,
        timestamp: i64,
        delivered: bool,
        body: MessageBody,
    ) -> Self {
        Self {
            id,
            channels,
            client_id,
            timestamp,
            delivered,
            body,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }

    pub fn category(&self) -> Category {
        self.body.category()
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn is_wildcard(&self) -> bool {
        self.channels.iter().any(|c| c == WILDCARD_CHANNEL)
    }

    /// Wire representation: envelope keys plus the body's own fields.
    pub fn to_value(&self) -> Value {
        let mut map = self.body.fields();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("type".into(), Value::String(self.kind().to_string()));
        map.insert(
            "channels".into(),
            Value::Array(self.channels.iter().cloned().map(Value::String).collect()),
        );
        if let Some(client_id) = &self.client_id {
            map.insert("clientId".into(), Value::String(client_id.clone()));
        }
        map.insert("delivered".into(), Value::Bool(self.delivered));
        map.insert("timestamp".into(), Value::from(self.timestamp));
        Value::Object(map)
    }
}

/// Envelope fields as they appear on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub channels: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    pub delivered: bool,
    pub timestamp: i64,
}

/// SHA-256 over the type, the channels, the body fields and a salt.
pub fn content_id(kind: &str, channels: &[String], fields: &Map<String, Value>, salt: &str) -> String {
    let material = Value::Array(vec![
        Value::from(kind),
        Value::from(channels.to_vec()),
        Value::Object(fields.clone()),
        Value::from(salt),
    ]);
    let mut hasher = Sha256::new();
    hasher.update(material.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
