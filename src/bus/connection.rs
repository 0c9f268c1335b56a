use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::message::BusMessage;

/// Close code for negotiation failures ("top layer error").
pub const PROTOCOL_ERROR_CLOSE_CODE: u16 = 4000;

/// Close reasons must fit in a control frame.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Write side of one socket. Frames go through the connection's forwarding task.
#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    sender: UnboundedSender<WsMessage>,
}

impl Connection {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("conn-{}", uuid::Uuid::new_v4()),
            sender,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.sender.send(WsMessage::text(text.into())).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: truncate_reason(reason).into(),
        };
        self.sender.send(WsMessage::Close(Some(frame))).is_ok()
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Per-dispatch context that never goes on the wire: the connection a
/// message came in on and the reply a handler wants sent back.
#[derive(Debug)]
pub struct DeliveryContext {
    pub connection: Connection,
    pub response: Option<BusMessage>,
}

impl DeliveryContext {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            response: None,
        }
    }

    pub fn respond(&mut self, message: BusMessage) {
        self.response = Some(message);
    }
}
