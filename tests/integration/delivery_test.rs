// Delivery loop behaviour: ack on success, requeue on failure, redelivery
// across reconnects and the poison-message policy of the profile worker.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use profile_relay::rabbitmq::mock::MockBroker;
use profile_relay::worker::{profile_handler, DbError, ProfileStore};
use profile_relay::{DeliveryHandler, Profile};
use support::{fast_settings, manager, manager_with, wait_until, RECONNECT_DELAY};
use tokio::sync::Notify;
use tokio::time::sleep;

fn counting_handler(calls: Arc<AtomicUsize>, fail: bool) -> DeliveryHandler {
    DeliveryHandler::new(move |_payload| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_successful_handler_acks_each_message_once() {
    let broker = MockBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let _manager = manager(&broker, Some(counting_handler(calls.clone(), false))).await;

    for i in 0..5 {
        broker.enqueue(format!("m{}", i).as_bytes());
    }
    wait_until("all messages acked", || broker.acked().len() == 5).await;
    sleep(RECONNECT_DELAY * 5).await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(broker.delivered().len(), 5);
    assert!(broker.delivered().iter().all(|d| !d.redelivered));
    assert!(broker.nacked().is_empty());
    assert_eq!(broker.queued(), 0);
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn test_failing_handler_requeues_and_message_reappears() {
    let broker = MockBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let settings = fast_settings().with_nack_delay(Duration::from_millis(10));
    let manager = manager_with(&broker, settings, Some(counting_handler(calls.clone(), true))).await;

    broker.enqueue(b"stuck");
    wait_until("several redeliveries", || broker.nacked().len() >= 3).await;
    manager.shutdown().await;

    assert!(broker.acked().is_empty());
    assert!(broker
        .nacked()
        .iter()
        .all(|(payload, requeue)| payload == b"stuck" && *requeue));

    let delivered = broker.delivered();
    assert!(delivered.len() >= 3);
    assert!(delivered.iter().all(|d| d.payload == b"stuck"));
    assert!(!delivered[0].redelivered);
    assert!(delivered[1..].iter().all(|d| d.redelivered));

    // Closing the channel puts the in-flight copy back.
    assert_eq!(broker.queued() + broker.unacked(), 1);
}

#[tokio::test]
async fn test_retry_after_transient_failure() {
    let broker = MockBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = DeliveryHandler::new(move |_payload| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("database restarting");
            }
            Ok(())
        }
    });
    let _manager = manager(&broker, Some(handler)).await;

    broker.enqueue(b"retry");
    wait_until("eventual ack", || broker.acked().len() == 1).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.nacked(), vec![(b"retry".to_vec(), true)]);
    assert!(broker.delivered()[1].redelivered);
}

#[tokio::test]
async fn test_messages_handled_in_broker_order() {
    let broker = MockBroker::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = DeliveryHandler::new(move |payload| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(payload);
            Ok::<_, anyhow::Error>(())
        }
    });
    let _manager = manager(&broker, Some(handler)).await;

    let expected: Vec<Vec<u8>> = (0..20).map(|i| format!("{:02}", i).into_bytes()).collect();
    for payload in &expected {
        broker.enqueue(payload);
    }
    wait_until("all handled", || seen.lock().unwrap().len() == 20).await;

    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_in_flight_message_is_redelivered_after_reconnect() {
    let broker = MockBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let (counter, release) = (calls.clone(), gate.clone());
    let handler = DeliveryHandler::new(move |_payload| {
        let (counter, release) = (counter.clone(), release.clone());
        async move {
            // The first attempt is still running when the connection dies.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                release.notified().await;
            }
            Ok::<_, anyhow::Error>(())
        }
    });
    let manager = manager(&broker, Some(handler)).await;

    broker.enqueue(b"slow");
    wait_until("first attempt started", || calls.load(Ordering::SeqCst) == 1).await;

    broker.sever("heartbeat timeout");
    wait_until("redelivery acked", || broker.acked().len() == 1).await;
    gate.notify_one();
    sleep(RECONNECT_DELAY * 5).await;

    assert_eq!(manager.generation(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // The stale ack from the first generation is rejected by the broker.
    assert_eq!(broker.acked(), vec![b"slow".to_vec()]);

    let delivered = broker.delivered();
    assert_eq!(delivered.len(), 2);
    assert!(delivered[1].redelivered);
    assert_ne!(delivered[0].connection_id, delivered[1].connection_id);
}

#[tokio::test]
async fn test_publisher_only_manager_does_not_consume() {
    let broker = MockBroker::new();
    let manager = manager(&broker, None).await;

    manager.publish(b"waiting").await.unwrap();

    assert!(!broker.has_consumer());
    assert!(broker.consumer_tags().is_empty());
    assert!(broker.delivered().is_empty());
    assert_eq!(broker.queued(), 1);
}

#[derive(Default)]
struct MemoryStore {
    rows: Mutex<Vec<Profile>>,
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn insert(&self, profile: &Profile) -> Result<(), DbError> {
        self.rows.lock().unwrap().push(profile.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_producer_to_store_with_poison_message() {
    let broker = MockBroker::new();
    let store = Arc::new(MemoryStore::default());
    let producer = manager(&broker, None).await;
    let _worker = manager(&broker, Some(profile_handler(store.clone()))).await;

    producer.publish(b"42").await.unwrap();
    producer.publish(br#"{"Name":"a","URL":"b"}"#).await.unwrap();
    wait_until("both messages settled", || broker.acked().len() == 2).await;

    // The undecodable message is dropped rather than requeued.
    assert!(broker.nacked().is_empty());
    assert_eq!(*store.rows.lock().unwrap(), vec![Profile::new("a", "b")]);
}
