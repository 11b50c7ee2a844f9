//! Postgres store and queue tests
//!
//! Run with `cargo test -p scanstate-ingest -- --ignored` on a machine with
//! Docker available.

mod common;

use common::{http_scan, TestPostgres};
use scanstate_common::{DataVersion, Scan, ScanKey};
use scanstate_ingest::queue::{PgQueue, PgQueueConfig, QueueError};
use scanstate_ingest::{
    InboundMessage, Ingestor, IngestorConfig, PgScanStore, ScanDecoder, ScanStore, Subscription,
    TracingReporter, UpsertOutcome,
};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn scan(data: &str, timestamp: i64) -> Scan {
    Scan {
        ip: Ipv4Addr::new(1, 2, 3, 4),
        port: 80,
        service: "http".to_string(),
        data_version: DataVersion::V2,
        data: data.as_bytes().to_vec(),
        timestamp,
    }
}

fn http_key() -> ScanKey {
    ScanKey::new(Ipv4Addr::new(1, 2, 3, 4), 80, "http")
}

fn fast_queue_config() -> PgQueueConfig {
    PgQueueConfig {
        poll_interval: Duration::from_millis(20),
        lease: Duration::from_secs(30),
        retry_base: Duration::from_millis(0),
        retry_max: Duration::from_millis(0),
        max_attempts: 2,
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_store_last_write_wins() {
    let pg = TestPostgres::start().await.unwrap();
    let store = PgScanStore::new(pg.pool_clone());

    assert_eq!(store.upsert(&scan("b", 200)).await.unwrap(), UpsertOutcome::Written);
    assert_eq!(store.upsert(&scan("a", 100)).await.unwrap(), UpsertOutcome::Stale);
    assert_eq!(store.upsert(&scan("c", 200)).await.unwrap(), UpsertOutcome::Stale);

    let row = store.get(&http_key()).await.unwrap().unwrap();
    assert_eq!(row.data, b"b");
    assert_eq!(row.updated_at.timestamp(), 200);

    assert_eq!(store.upsert(&scan("d", 300)).await.unwrap(), UpsertOutcome::Written);
    let row = store.get(&http_key()).await.unwrap().unwrap();
    assert_eq!(row.data, b"d");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_store_get_missing_key() {
    let pg = TestPostgres::start().await.unwrap();
    let store = PgScanStore::new(pg.pool_clone());

    assert!(store.get(&http_key()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires Docker
async fn test_store_concurrent_upserts_converge() {
    let pg = TestPostgres::start().await.unwrap();
    let store = PgScanStore::new(pg.pool_clone());

    let mut handles = Vec::new();
    for ts in (1..=100).map(|i: i64| (i * 37) % 100 + 1) {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.upsert(&scan(&format!("v{ts}"), ts)).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let row = store.get(&http_key()).await.unwrap().unwrap();
    assert_eq!(row.data, b"v100");
    assert_eq!(row.updated_at.timestamp(), 100);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_queue_ack_removes_message() {
    let pg = TestPostgres::start().await.unwrap();
    let queue = PgQueue::new(pg.pool_clone(), fast_queue_config());

    queue.publish(b"payload").await.unwrap();
    assert_eq!(queue.depth().await.unwrap().pending, 1);

    let message = queue.claim().await.unwrap().unwrap();
    assert_eq!(message.body(), b"payload");
    assert_eq!(message.delivery_attempt(), 1);

    // Leased messages are invisible to other consumers
    assert!(queue.claim().await.unwrap().is_none());

    message.ack().await.unwrap();
    let depth = queue.depth().await.unwrap();
    assert_eq!(depth.pending, 0);
    assert_eq!(depth.failed, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_queue_nack_redelivers_then_parks_as_failed() {
    let pg = TestPostgres::start().await.unwrap();
    let queue = PgQueue::new(pg.pool_clone(), fast_queue_config());
    queue.publish(b"poison").await.unwrap();

    let first = queue.claim().await.unwrap().unwrap();
    first.nack().await.unwrap();

    let second = queue.claim().await.unwrap().unwrap();
    assert_eq!(second.delivery_attempt(), 2);
    second.nack().await.unwrap();

    assert!(queue.claim().await.unwrap().is_none());
    let depth = queue.depth().await.unwrap();
    assert_eq!(depth.pending, 0);
    assert_eq!(depth.failed, 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_queue_expired_lease_is_reclaimed() {
    let pg = TestPostgres::start().await.unwrap();
    let config = PgQueueConfig {
        lease: Duration::from_millis(100),
        ..fast_queue_config()
    };
    let queue = PgQueue::new(pg.pool_clone(), config);
    queue.publish(b"slow consumer").await.unwrap();

    let stale = queue.claim().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let fresh = queue.claim().await.unwrap().unwrap();
    assert_eq!(fresh.id(), stale.id());
    assert_eq!(fresh.delivery_attempt(), 2);

    assert!(matches!(stale.ack().await, Err(QueueError::LeaseLost(_))));
    fresh.ack().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_subscription_polls_until_message_arrives() {
    let pg = TestPostgres::start().await.unwrap();
    let queue = PgQueue::new(pg.pool_clone(), fast_queue_config());
    let mut subscription = queue.subscribe();

    let publisher = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher.publish(b"late").await.unwrap();
    });

    let message = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.body(), b"late");
    message.ack().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_ingestor_end_to_end_over_postgres() {
    let pg = TestPostgres::start().await.unwrap();
    let queue = PgQueue::new(pg.pool_clone(), fast_queue_config());

    queue.publish(http_scan("world", 200).as_bytes()).await.unwrap();
    queue.publish(http_scan("hello", 100).as_bytes()).await.unwrap();
    queue.publish(b"garbage").await.unwrap();

    let ingestor = Ingestor::new(
        ScanDecoder::default(),
        PgScanStore::new(pg.pool_clone()),
        TracingReporter,
        IngestorConfig::default(),
    );
    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let ingestor = ingestor.clone();
        let subscription = queue.subscribe();
        let shutdown = shutdown.clone();
        async move { ingestor.run(subscription, shutdown).await }
    });

    // Two acked messages disappear; the garbage one ends up failed
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let depth = queue.depth().await.unwrap();
        if depth.pending == 0 && depth.failed == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue did not drain: {depth:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    let stats = run.await.unwrap();

    let row = ingestor.store().get(&http_key()).await.unwrap().unwrap();
    assert_eq!(row.data, b"world");
    assert_eq!(row.updated_at.timestamp(), 200);
    assert_eq!(stats.acknowledged(), 2);
    assert_eq!(stats.decode_rejected, 2);
}
