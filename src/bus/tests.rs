use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use super::{BusEngine, Connection, PROTOCOL_ERROR_CLOSE_CODE};
use crate::message::{BusMessage, Category, FieldKind, MessageBody, MessageType};

#[test]
fn test_encode_decode_preserves_message() {
    let engine = BusEngine::new();
    let mut message = BusMessage::text(vec!["x".into()], "hello");
    message.client_id = Some("client-a".into());

    let decoded = engine.decode(&engine.encode(&message)).expect("decodes");
    assert_eq!(decoded.id(), message.id());
    assert_eq!(decoded, message);
}

#[test]
fn test_receipt_round_trip() {
    let engine = BusEngine::new();
    let mut original = BusMessage::broadcast("hello");
    original.client_id = Some("client-a".into());

    let receipt = engine.receipt_for(&original, true);
    assert_eq!(receipt.kind(), "DeliveryReceipt");
    assert!(receipt.delivered);
    assert_ne!(receipt.id(), original.id());

    // over the wire and back
    let receipt = engine.decode(&engine.encode(&receipt)).expect("receipt decodes");
    let unwrapped = engine.unwrap_receipt(&receipt).expect("original decodes");
    assert_eq!(unwrapped.id(), original.id());
    assert!(unwrapped.delivered);
    assert_eq!(unwrapped.body(), original.body());
}

#[test]
fn test_undelivered_receipt() {
    let engine = BusEngine::new();
    let original = BusMessage::text(vec!["nobody".into()], "hello?");
    let receipt = engine.receipt_for(&original, false);
    let unwrapped = engine.unwrap_receipt(&receipt).unwrap();
    assert!(!unwrapped.delivered);
}

#[test]
fn test_unwrap_non_receipt_is_none() {
    let engine = BusEngine::new();
    assert!(engine.unwrap_receipt(&BusMessage::ping()).is_none());
}

#[test]
fn test_receipt_for_unknown_type_cannot_be_unwrapped() {
    let mut sender_engine = BusEngine::new();
    sender_engine
        .attach(MessageType::with_fields(
            "Exchange",
            Category::Communication,
            &[("pair", FieldKind::String)],
        ))
        .unwrap();
    let mut fields = serde_json::Map::new();
    fields.insert("pair".into(), "BTC/EUR".into());
    let original = BusMessage::new(
        vec!["x".into()],
        MessageBody::Custom {
            kind: "Exchange".into(),
            category: Category::Communication,
            fields,
        },
    );
    let receipt = sender_engine.receipt_for(&original, true);

    assert!(sender_engine.unwrap_receipt(&receipt).is_some());
    // an engine without the type drops the embedded original
    assert!(BusEngine::new().unwrap_receipt(&receipt).is_none());
}

#[test]
fn test_connection_close_frame() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = Connection::new(tx);
    assert!(connection.is_open());

    let long_reason = "x".repeat(500);
    assert!(connection.close(PROTOCOL_ERROR_CLOSE_CODE, &long_reason));

    match rx.try_recv().unwrap() {
        WsMessage::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::from(PROTOCOL_ERROR_CLOSE_CODE));
            assert_eq!(frame.reason.len(), 123);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[test]
fn test_connection_send_after_drop_fails() {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Connection::new(tx);
    drop(rx);
    assert!(!connection.is_open());
    assert!(!connection.send_text("hello"));
}
