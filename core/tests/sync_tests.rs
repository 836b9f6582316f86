/// Live subscription tests: snapshot-then-live ordering, reconnect backfill,
/// retry budget and cancellation

use chatsync_core::backend::{Backend, MemoryBackend, SledBackend};
use chatsync_core::{ChatEngine, Config, Message, SyncError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};

fn fast_config() -> Config {
    Config {
        sync_max_retries: 3,
        sync_initial_backoff: Duration::from_millis(5),
        sync_max_backoff: Duration::from_millis(20),
        ..Config::in_memory()
    }
}

fn engine_over(backend: Arc<dyn Backend>, config: Config) -> ChatEngine {
    ChatEngine::with_backend(config, backend).unwrap()
}

async fn next(rx: &mut UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription channel closed")
}

async fn assert_quiet(rx: &mut UnboundedReceiver<Message>) {
    if let Ok(Some(extra)) = timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected delivery: {:?}", extra);
    }
}

#[tokio::test]
async fn test_snapshot_then_live() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let mut existing = Vec::new();
    for i in 0..3 {
        existing.push(engine.append(&room.id, "u1", &format!("old {}", i), None).unwrap());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = engine
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();

    for expected in &existing {
        assert_eq!(&next(&mut rx).await, expected);
    }

    let live1 = engine.append(&room.id, "u2", "new 1", None).unwrap();
    let live2 = engine.append(&room.id, "u1", "new 2", None).unwrap();
    assert_eq!(next(&mut rx).await, live1);
    assert_eq!(next(&mut rx).await, live2);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_other_rooms_are_filtered() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let watched = engine.get_or_create_room("u1", "u2").unwrap();
    let other = engine.get_or_create_room("u1", "u3").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = engine
        .subscribe(&watched.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();

    engine.append(&other.id, "u3", "elsewhere", None).unwrap();
    let mine = engine.append(&watched.id, "u2", "here", None).unwrap();
    assert_eq!(next(&mut rx).await, mine);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_concurrent_senders_arrive_in_order() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = engine
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();

    let writers: Vec<_> = ["u1", "u2"]
        .into_iter()
        .map(|sender| {
            let engine = engine.clone();
            let room_id = room.id.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..50 {
                    engine
                        .append(&room_id, sender, &format!("{} {}", sender, i), None)
                        .unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..100 {
        received.push(next(&mut rx).await);
    }
    assert!(received.windows(2).all(|w| w[0].id < w[1].id));
    assert!(received.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert_eq!(received, engine.list_messages(&room.id).unwrap());
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_reconnect_backfills_without_duplicates() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(backend.clone(), fast_config());
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<SyncError>();
    let sub = engine
        .subscribe(
            &room.id,
            move |m| {
                let _ = tx.send(m);
            },
            move |e| {
                let _ = err_tx.send(e);
            },
        )
        .unwrap();

    let m1 = engine.append(&room.id, "u1", "before drop", None).unwrap();
    assert_eq!(next(&mut rx).await, m1);

    // Connection reset: the open watch closes
    backend.drop_watchers();
    let m2 = engine.append(&room.id, "u2", "during outage", None).unwrap();
    let m3 = engine.append(&room.id, "u1", "after outage", None).unwrap();

    assert_eq!(next(&mut rx).await, m2);
    assert_eq!(next(&mut rx).await, m3);
    assert_quiet(&mut rx).await;

    let m4 = engine.append(&room.id, "u2", "live again", None).unwrap();
    assert_eq!(next(&mut rx).await, m4);

    assert!(sub.is_active());
    assert!(err_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_retry_budget_exhaustion_reports_error() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_over(backend.clone(), fast_config());
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<SyncError>();
    let sub = engine
        .subscribe(
            &room.id,
            move |m| {
                let _ = tx.send(m);
            },
            move |e| {
                let _ = err_tx.send(e);
            },
        )
        .unwrap();

    let m1 = engine.append(&room.id, "u1", "hello", None).unwrap();
    assert_eq!(next(&mut rx).await, m1);

    backend.set_offline(true);
    backend.drop_watchers();

    let err = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("on_error was not called")
        .expect("error channel closed");
    assert!(err.is_retryable());
    assert!(!sub.is_active());

    // The message callback was dropped, closing its channel
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_recovers_within_retry_budget() {
    let backend = Arc::new(MemoryBackend::new());
    let config = Config {
        sync_max_retries: 50,
        ..fast_config()
    };
    let engine = engine_over(backend.clone(), config);
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = engine
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();
    let m1 = engine.append(&room.id, "u1", "one", None).unwrap();
    assert_eq!(next(&mut rx).await, m1);

    backend.set_offline(true);
    backend.drop_watchers();
    sleep(Duration::from_millis(50)).await;
    backend.set_offline(false);

    let m2 = engine.append(&room.id, "u2", "two", None).unwrap();
    assert_eq!(next(&mut rx).await, m2);
}

#[tokio::test]
async fn test_no_delivery_after_unsubscribe() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = engine
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();

    let m1 = engine.append(&room.id, "u1", "seen", None).unwrap();
    assert_eq!(next(&mut rx).await, m1);

    engine.unsubscribe(sub);
    engine.append(&room.id, "u2", "not delivered", None).unwrap();

    // The callback (and the sender it owned) is gone
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropping_subscription_cancels() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let sub = engine
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();
    drop(sub);

    engine.append(&room.id, "u1", "nobody listening", None).unwrap();
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_subscribe_unknown_room() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let err = engine.subscribe("no-such-room", |_| {}, |_| {}).unwrap_err();
    assert!(matches!(err, SyncError::RoomNotFound(_)));
}

#[tokio::test]
async fn test_subscription_after_clear_sees_only_new_messages() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let room = engine.get_or_create_room("u1", "u2").unwrap();
    engine.append(&room.id, "u1", "gone", None).unwrap();
    engine.clear(&room.id).unwrap();
    let kept = engine.append(&room.id, "u2", "kept", None).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = engine
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();
    assert_eq!(next(&mut rx).await, kept);
    assert_quiet(&mut rx).await;
}

/// Two engines on one backend play two clients writing the same room
async fn two_clients_one_room(backend: Arc<dyn Backend>) {
    let client_a = engine_over(backend.clone(), fast_config());
    let client_b = engine_over(backend, fast_config());
    let room = client_a.get_or_create_room("u1", "u2").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = client_a
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let (engine, sender) = if w % 2 == 0 {
                (client_a.clone(), "u1")
            } else {
                (client_b.clone(), "u2")
            };
            let room_id = room.id.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..150 {
                    engine
                        .append(&room_id, sender, &format!("w{} #{}", w, i), None)
                        .unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap();
    }

    let stored = client_b.list_messages(&room.id).unwrap();
    assert_eq!(stored.len(), 600);
    assert!(stored.windows(2).all(|w| w[0].id < w[1].id));
    assert!(stored.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    let mut delivered = Vec::new();
    for _ in 0..stored.len() {
        delivered.push(next(&mut rx).await);
    }
    assert_eq!(delivered, stored);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_two_clients_memory_backend() {
    two_clients_one_room(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn test_two_clients_sled_backend() {
    two_clients_one_room(Arc::new(SledBackend::temporary().unwrap())).await;
}

#[tokio::test]
async fn test_subscribe_over_sled_store() {
    let dir = TempDir::new().unwrap();
    let engine = ChatEngine::open(Config {
        data_dir: Some(dir.path().to_path_buf()),
        ..fast_config()
    })
    .unwrap();
    let room = engine.get_or_create_room("u1", "u2").unwrap();
    let stored = engine.append(&room.id, "u1", "on disk", None).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = engine
        .subscribe(&room.id, move |m| {
            let _ = tx.send(m);
        }, |_| {})
        .unwrap();
    assert_eq!(next(&mut rx).await, stored);

    let live = engine.append(&room.id, "u2", "live from disk", None).unwrap();
    assert_eq!(next(&mut rx).await, live);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_unsubscribe_from_inside_callback() {
    let engine = ChatEngine::open(fast_config()).unwrap();
    let room = engine.get_or_create_room("u1", "u2").unwrap();

    let own_subscription = Arc::new(Mutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = {
        let own_subscription = own_subscription.clone();
        engine
            .subscribe(&room.id, move |m| {
                let _ = tx.send(m);
                // Dropping the handle here ends the subscription
                own_subscription.lock().unwrap().take();
            }, |_| {})
            .unwrap()
    };
    *own_subscription.lock().unwrap() = Some(sub);

    let first = engine.append(&room.id, "u1", "first", None).unwrap();
    engine.append(&room.id, "u2", "second", None).unwrap();

    assert_eq!(next(&mut rx).await, first);
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    assert!(own_subscription.lock().unwrap().is_none());
}
