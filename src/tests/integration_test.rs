use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::broadcast::Receiver;

use crate::bus::BusEngine;
use crate::client::BusClient;
use crate::config::{BusSettings, Settings};
use crate::database::BusDatabase;
use crate::lock::{LockAuthority, LockId, LockService};
use crate::message::{BusMessage, LockResult, MessageBody};
use crate::persistence::SledStore;
use crate::server::{BusServer, serve};

fn bus_settings() -> BusSettings {
    BusSettings {
        heartbeat_interval_ms: 100,
        reconnect_interval_ms: 50,
        ..Settings::default().bus
    }
}

async fn next_event<F>(events: &mut Receiver<BusMessage>, mut matches: F) -> BusMessage
where
    F: FnMut(&BusMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = events.recv().await.expect("event stream open");
            if matches(&message) {
                return message;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn connect(url: &str, channel: &str) -> (Arc<BusClient>, Receiver<BusMessage>) {
    let client = Arc::new(BusClient::new(channel, &bus_settings()));
    let mut events = client.subscribe();
    tokio::spawn(client.clone().run(url.to_string()));
    next_event(&mut events, |m| m.kind() == "Join").await;
    (client, events)
}

#[tokio::test]
async fn integration_bus_end_to_end() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path().to_str().unwrap()).unwrap());
    let database = BusDatabase::new(store, "broker-1", &bus_settings());
    let mut server = BusServer::new(BusEngine::new(), database.clone());
    server.register_handler("RequestLock", Arc::new(LockAuthority::new(database)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(serve(listener, Arc::new(server)));

    let (a, mut a_events) = connect(&url, "x").await;
    let (_b, mut b_events) = connect(&url, "y").await;

    // wildcard broadcast reaches b, and a learns it was delivered
    let message = BusMessage::broadcast("hello bus");
    assert!(a.send(message.clone()));

    let received = next_event(&mut b_events, |m| m.id() == message.id()).await;
    match received.body() {
        MessageBody::Text { text } => assert_eq!(text, "hello bus"),
        other => panic!("expected text, got {other:?}"),
    }
    assert_eq!(received.client_id, a.client_id());

    let confirmed = next_event(&mut a_events, |m| m.id() == message.id()).await;
    assert!(confirmed.delivered);

    // nobody listens on z
    let lonely = BusMessage::text(vec!["z".into()], "anyone?");
    assert!(a.send(lonely.clone()));
    let unconfirmed = next_event(&mut a_events, |m| m.id() == lonely.id()).await;
    assert!(!unconfirmed.delivered);
}

#[tokio::test]
async fn integration_lock_round_trip() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path().to_str().unwrap()).unwrap());
    let database = BusDatabase::new(store, "broker-1", &bus_settings());
    let mut server = BusServer::new(BusEngine::new(), database.clone());
    server.register_handler("RequestLock", Arc::new(LockAuthority::new(database)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(serve(listener, Arc::new(server)));

    let (a, _a_events) = connect(&url, "main").await;
    let (b, _b_events) = connect(&url, "main").await;
    let a_locks = Arc::new(LockService::new(a));
    let b_locks = Arc::new(LockService::new(b));
    a_locks.spawn_listener();
    b_locks.spawn_listener();

    let lock = LockId::builder().with("integration").build();
    let timeout = Duration::from_secs(2);
    let hold = Duration::from_secs(30);

    assert_eq!(a_locks.acquire(&lock, timeout, hold).await.unwrap(), LockResult::Locked);
    assert_eq!(b_locks.acquire(&lock, timeout, hold).await.unwrap(), LockResult::Cannot);
    assert_eq!(a_locks.release(&lock, timeout).await.unwrap(), LockResult::Released);
    assert_eq!(b_locks.acquire(&lock, timeout, hold).await.unwrap(), LockResult::Locked);
}
