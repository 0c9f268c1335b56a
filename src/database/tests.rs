use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;

use super::BusDatabase;
use crate::config::Settings;
use crate::lock::LockId;
use crate::message::BusMessage;
use crate::persistence::{SledStore, Store};
use crate::utils::BusError;

fn shared_store() -> (Arc<SledStore>, TempDir) {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap()).unwrap();
    (Arc::new(store), dir)
}

fn database(store: &Arc<SledStore>, server_id: &str) -> BusDatabase {
    let settings = Settings::default();
    BusDatabase::new(store.clone(), server_id, &settings.bus)
}

fn sent_by(mut message: BusMessage, client_id: &str) -> BusMessage {
    message.client_id = Some(client_id.to_string());
    message
}

#[tokio::test]
async fn test_join_and_leave_membership() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");

    db.join("x", "client-a").await.unwrap();
    let members = db.members(Some("x")).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].client_id, "client-a");
    assert_eq!(members[0].server_id, "server-1");

    db.leave("x", "client-a").await.unwrap();
    assert!(db.members(Some("x")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fan_out_by_channel_and_wildcard() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    db.join("x", "client-a").await.unwrap();
    db.join("y", "client-b").await.unwrap();

    let to_x = sent_by(BusMessage::text(vec!["x".into()], "only x"), "client-c");
    assert!(db.post(&to_x).await.unwrap());
    assert_eq!(db.queued("client-a").await.unwrap().len(), 1);
    assert!(db.queued("client-b").await.unwrap().is_empty());

    let to_all = sent_by(BusMessage::broadcast("everyone"), "client-c");
    assert!(db.post(&to_all).await.unwrap());
    assert_eq!(db.queued("client-a").await.unwrap().len(), 2);
    assert_eq!(db.queued("client-b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_post_without_subscribers_is_undelivered() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    db.join("x", "client-a").await.unwrap();

    let nobody = sent_by(BusMessage::text(vec!["z".into()], "void"), "client-a");
    assert!(!db.post(&nobody).await.unwrap());

    // the sender is never its own recipient
    let own = sent_by(BusMessage::text(vec!["x".into()], "echo"), "client-a");
    assert!(!db.post(&own).await.unwrap());
    assert!(db.queued("client-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_post_across_replicas_queues_once() {
    let (store, _dir) = shared_store();
    let replica_a = database(&store, "server-a");
    let replica_b = database(&store, "server-b");
    replica_a.join("x", "client-a").await.unwrap();
    replica_a.join("y", "client-b").await.unwrap();

    let message = sent_by(BusMessage::broadcast("once"), "client-c");
    assert!(replica_a.post(&message).await.unwrap());
    assert!(replica_b.post(&message).await.unwrap());

    assert_eq!(replica_a.queued("client-a").await.unwrap().len(), 1);
    assert_eq!(replica_a.queued("client-b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_post_notifies_recipients() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    let (tx, mut rx) = mpsc::unbounded_channel();
    store.subscribe("client-a", tx);
    db.join("x", "client-a").await.unwrap();

    let message = sent_by(BusMessage::text(vec!["x".into()], "wake"), "client-b");
    db.post(&message).await.unwrap();
    assert_eq!(rx.try_recv().unwrap(), "client-a");
}

#[tokio::test]
async fn test_take_messages_drains_queue_in_order() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    db.join("x", "client-a").await.unwrap();

    let first = sent_by(BusMessage::text(vec!["x".into()], "1"), "client-b");
    let second = sent_by(BusMessage::text(vec!["x".into()], "2"), "client-b");
    db.post(&first).await.unwrap();
    db.post(&second).await.unwrap();

    let taken = db.take_messages("client-a").await.unwrap();
    let ids: Vec<_> = taken.iter().map(|v| v.id.as_str()).collect();
    assert_eq!(ids, [first.id(), second.id()]);
    assert!(db.queued("client-a").await.unwrap().is_empty());

    db.record_history("client-a", taken).await.unwrap();
    assert_eq!(db.history("client-a").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_leave_drops_pending_messages() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    db.join("x", "client-a").await.unwrap();
    let message = sent_by(BusMessage::text(vec!["x".into()], "late"), "client-b");
    db.post(&message).await.unwrap();

    db.leave("x", "client-a").await.unwrap();
    assert!(db.queued("client-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lock_and_execute_runs_once_per_window() {
    let (store, _dir) = shared_store();
    let replica_a = database(&store, "server-a");
    let replica_b = database(&store, "server-b");
    let lock = LockId::builder().with("op").with("42").build();

    let ran = replica_a
        .lock_and_execute(&lock, || async { Ok::<(), BusError>(()) })
        .await
        .unwrap();
    assert!(ran);

    let executed = AtomicBool::new(false);
    let ran = replica_b
        .lock_and_execute(&lock, || async {
            executed.store(true, Ordering::SeqCst);
            Ok::<(), BusError>(())
        })
        .await
        .unwrap();
    assert!(!ran);
    assert!(!executed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_failed_operation_releases_lock() {
    let (store, _dir) = shared_store();
    let replica_a = database(&store, "server-a");
    let replica_b = database(&store, "server-b");
    let lock = LockId::builder().with("op").with("flaky").build();

    let result = replica_a
        .lock_and_execute(&lock, || async { Err::<(), BusError>(BusError::execution("boom")) })
        .await;
    assert!(result.is_err());

    let ran = replica_b
        .lock_and_execute(&lock, || async { Ok::<(), BusError>(()) })
        .await
        .unwrap();
    assert!(ran);
}

#[tokio::test]
async fn test_touch_refreshes_membership() {
    let (store, _dir) = shared_store();
    let mut settings = Settings::default();
    settings.bus.membership_ttl_secs = 1;
    let db = BusDatabase::new(store.clone(), "server-1", &settings.bus);

    db.join("x", "client-a").await.unwrap();
    let joined_at = db.members(Some("x")).await.unwrap()[0].joined_at;

    // every ping refreshes; none is mistaken for a duplicate
    for ping in ["ping-1", "ping-2"] {
        tokio::time::sleep(Duration::from_millis(600)).await;
        db.touch("x", "client-a", ping).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    let members = db.members(Some("x")).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].joined_at, joined_at);
}

#[tokio::test]
async fn test_exclusive_releases_after_success() {
    let (store, _dir) = shared_store();
    let replica_a = database(&store, "server-a");
    let replica_b = database(&store, "server-b");
    let lock = LockId::builder().with("op").with("repeatable").build();

    let first = replica_a
        .exclusive(&lock, || async { Ok::<u8, BusError>(1) })
        .await
        .unwrap();
    let second = replica_b
        .exclusive(&lock, || async { Ok::<u8, BusError>(2) })
        .await
        .unwrap();
    assert_eq!(first, Some(1));
    assert_eq!(second, Some(2));
}

#[tokio::test]
async fn test_client_locks_cannot_preempt_broker_operations() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    db.join("main", "client-b").await.unwrap();

    let message = sent_by(BusMessage::text(vec!["main".into()], "hi"), "client-a");
    let post_lock = LockId::builder().with("post").with(message.id()).build();
    let leave_lock = LockId::builder()
        .with("leave")
        .with("main")
        .with("client-b")
        .build();
    let hold = Duration::from_secs(60);
    assert!(db.acquire_lock(post_lock.as_str(), "client-a", hold).await.unwrap());
    assert!(db.acquire_lock(leave_lock.as_str(), "client-a", hold).await.unwrap());

    assert!(db.post(&message).await.unwrap());
    assert_eq!(db.queued("client-b").await.unwrap().len(), 1);

    db.leave("main", "client-b").await.unwrap();
    assert!(db.members(Some("main")).await.unwrap().is_empty());
    assert!(db.queued("client-b").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queued_messages_expire_with_membership() {
    let (store, _dir) = shared_store();
    let mut settings = Settings::default();
    settings.bus.membership_ttl_secs = 1;
    let db = BusDatabase::new(store.clone(), "server-1", &settings.bus);

    db.join("x", "client-a").await.unwrap();
    let message = sent_by(BusMessage::text(vec!["x".into()], "orphan"), "client-b");
    db.post(&message).await.unwrap();
    let queued = db.queued("client-a").await.unwrap();
    assert!(queued[0].expires_at.is_some());

    // the broker died: no leave ever runs
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(db.members(Some("x")).await.unwrap().is_empty());
    assert!(db.queued("client-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_requeue_restores_taken_messages() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    db.join("x", "client-a").await.unwrap();
    let first = sent_by(BusMessage::text(vec!["x".into()], "1"), "client-b");
    let second = sent_by(BusMessage::text(vec!["x".into()], "2"), "client-b");
    db.post(&first).await.unwrap();
    db.post(&second).await.unwrap();

    let taken = db.take_messages("client-a").await.unwrap();
    db.requeue("client-a", taken.clone()).await.unwrap();

    let queued = db.queued("client-a").await.unwrap();
    let ids: Vec<_> = queued.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, [first.id(), second.id()]);
    assert_eq!(queued[0].content, taken[0].content);

    // taking twice in a row is never suppressed
    assert_eq!(db.take_messages("client-a").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_membership_expires_without_touch() {
    let (store, _dir) = shared_store();
    let mut settings = Settings::default();
    settings.bus.membership_ttl_secs = 1;
    let db = BusDatabase::new(store.clone(), "server-1", &settings.bus);

    db.join("x", "client-a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(db.members(Some("x")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_operations_fail_when_store_closed() {
    let (store, _dir) = shared_store();
    let db = database(&store, "server-1");
    store.close().unwrap();

    assert!(matches!(
        db.join("x", "client-a").await,
        Err(BusError::StoreNotReady)
    ));
    assert!(matches!(
        db.take_messages("client-a").await,
        Err(BusError::StoreNotReady)
    ));
    let message = BusMessage::broadcast("x");
    assert!(matches!(db.post(&message).await, Err(BusError::StoreNotReady)));
}
