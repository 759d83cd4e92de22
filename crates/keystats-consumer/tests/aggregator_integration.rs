//! End-to-end tests of the aggregation engine against the in-process broker.

use async_trait::async_trait;
use keystats_consumer::{
    Aggregator, AggregatorConfig, ConsumerGroup, GroupSessionHandle, MemoryBroker,
    MemoryConsumerGroup, RecordProducer,
};
use keystats_core::{partition_for_keystem, DeleteRequest, KeyStats, Message, Sample};
use keystats_metadata::{MemoryStatsStore, SqliteStatsStore, StatsStore};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

const GROUP: &str = "aggregators";
const HOUR: Duration = Duration::from_secs(3600);

fn sample(keystem: &str, latency: f64) -> Message {
    let mut sample = Sample::new(keystem);
    sample.total_items = 2;
    sample.total_volume = 4.0;
    sample.volume_utilization = 0.5;
    sample.status_code = "200".to_string();
    sample.time_stamp = format!("ts-{}", latency);
    sample.latency = latency;
    Message::Stats(sample)
}

fn delete(keystem: &str) -> Message {
    Message::Delete(DeleteRequest::new(keystem))
}

fn aggregator(store: Arc<dyn StatsStore>, flush_interval: Duration) -> Aggregator {
    Aggregator::builder()
        .config(AggregatorConfig::default().flush_interval(flush_interval))
        .store(store)
        .build()
        .unwrap()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Member whose first session starts normally and whose rejoin never completes.
struct StalledRejoin {
    inner: MemoryConsumerGroup,
    sessions: AtomicUsize,
}

impl StalledRejoin {
    fn new(inner: MemoryConsumerGroup) -> Self {
        Self {
            inner,
            sessions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConsumerGroup for StalledRejoin {
    async fn next_session(&self) -> keystats_consumer::Result<GroupSessionHandle> {
        if self.sessions.fetch_add(1, Ordering::SeqCst) > 0 {
            std::future::pending::<()>().await;
        }
        self.inner.next_session().await
    }

    async fn close(&self) -> keystats_consumer::Result<()> {
        self.inner.close().await
    }
}

fn keystems_on(partition: i32, partitions: u32, count: usize) -> Vec<String> {
    (0..)
        .map(|k| format!("tenant-{}", k))
        .filter(|k| partition_for_keystem(k, partitions) == partition)
        .take(count)
        .collect()
}

async fn stored(store: &dyn StatsStore, keystem: &str) -> Option<KeyStats> {
    store
        .get_key_stats(&[keystem.to_string()])
        .await
        .unwrap()
        .remove(keystem)
}

#[tokio::test]
async fn test_samples_are_aggregated_and_checkpointed() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 1);
    let producer = broker.producer();
    for latency in [5.0, 20.0, 3.0] {
        producer.send_message(&sample("acme", latency)).await.unwrap();
    }

    let aggregator = aggregator(store.clone(), Duration::ZERO);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    eventually("three samples flushed", || async {
        stored(store.as_ref(), "acme")
            .await
            .map_or(false, |s| s.total_requests == 3)
    })
    .await;

    let acme = stored(store.as_ref(), "acme").await.unwrap();
    assert!((acme.avg_latency - 28.0 / 3.0).abs() < 1e-9);
    assert_eq!(acme.highest_latency.latency, 20.0);
    assert_eq!(acme.highest_latency.time_stamp, "ts-20");
    assert_eq!(acme.total_items, 6);
    assert_eq!(store.checkpoints().await[&0], 2);

    handle.shutdown().await.unwrap();
    assert_eq!(broker.committed_offset(GROUP, 0).await, Some(3));
}

#[tokio::test]
async fn test_delete_unknown_keystem_is_persisted_empty() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 4);
    let aggregator = aggregator(store.clone(), HOUR);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    broker.producer().send_message(&delete("ghost")).await.unwrap();

    eventually("empty aggregate written", || async {
        stored(store.as_ref(), "ghost").await.is_some()
    })
    .await;
    assert!(stored(store.as_ref(), "ghost").await.unwrap().is_empty());

    let partition = partition_for_keystem("ghost", 4);
    assert_eq!(store.checkpoints().await[&partition], 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_resets_stored_aggregate() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 1);
    let producer = broker.producer();
    producer.send_message(&sample("acme", 1.0)).await.unwrap();
    producer.send_message(&sample("acme", 2.0)).await.unwrap();
    producer.send_message(&delete("acme")).await.unwrap();
    producer.send_message(&sample("acme", 9.0)).await.unwrap();

    let aggregator = aggregator(store.clone(), Duration::ZERO);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    eventually("post-delete sample flushed", || async {
        store.checkpoints().await.get(&0) == Some(&3)
    })
    .await;

    let acme = stored(store.as_ref(), "acme").await.unwrap();
    assert_eq!(acme.total_requests, 1);
    assert_eq!(acme.avg_latency, 9.0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sample_flush_waits_for_interval() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 1);
    let producer = broker.producer();
    for latency in [1.0, 2.0, 3.0, 4.0] {
        producer.send_message(&sample("acme", latency)).await.unwrap();
    }

    let aggregator = aggregator(store.clone(), HOUR);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    eventually("all samples applied in memory", || async {
        aggregator.offsets().await.get(&0) == Some(&3)
    })
    .await;

    // Only the first sample flushed; the rest wait for the interval
    assert_eq!(store.committed_flushes(), 1);
    assert_eq!(stored(store.as_ref(), "acme").await.unwrap().total_requests, 1);
    assert_eq!(aggregator.key_stats("acme").await.unwrap().total_requests, 4);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_performs_final_flush() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 1);
    let producer = broker.producer();
    for latency in [1.0, 2.0, 3.0] {
        producer.send_message(&sample("acme", latency)).await.unwrap();
    }

    let aggregator = aggregator(store.clone(), HOUR);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));
    eventually("samples applied", || async {
        aggregator.offsets().await.get(&0) == Some(&2)
    })
    .await;

    handle.shutdown().await.unwrap();

    assert_eq!(stored(store.as_ref(), "acme").await.unwrap().total_requests, 3);
    assert_eq!(store.checkpoints().await[&0], 2);
    // Claims are released
    assert_eq!(broker.generation(GROUP).await, Some(2));
}

#[tokio::test]
async fn test_failed_flush_keeps_state_for_retry() {
    let store = Arc::new(MemoryStatsStore::new());
    store.fail_next_flushes(1);
    let broker = MemoryBroker::new("statistics", 1);
    let producer = broker.producer();

    let aggregator = aggregator(store.clone(), Duration::ZERO);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    producer.send_message(&sample("acme", 10.0)).await.unwrap();
    eventually("first sample applied", || async {
        aggregator.offsets().await.get(&0) == Some(&0)
    })
    .await;
    assert!(stored(store.as_ref(), "acme").await.is_none());
    assert!(store.checkpoints().await.is_empty());

    producer.send_message(&sample("acme", 30.0)).await.unwrap();
    eventually("retry flushed both samples", || async {
        store.checkpoints().await.get(&0) == Some(&1)
    })
    .await;

    let acme = stored(store.as_ref(), "acme").await.unwrap();
    assert_eq!(acme.total_requests, 2);
    assert_eq!(acme.avg_latency, 20.0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_and_untyped_records_are_skipped() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 1);
    let producer = broker.producer();

    producer.send_raw("acme", vec![], "{}").await.unwrap();
    producer
        .send_raw("acme", vec![("type".to_string(), b"purge".to_vec())], "{}")
        .await
        .unwrap();
    producer
        .send_raw("acme", vec![("type".to_string(), b"stats".to_vec())], "{broken")
        .await
        .unwrap();
    producer.send_message(&sample("acme", 7.0)).await.unwrap();

    let aggregator = aggregator(store.clone(), Duration::ZERO);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    eventually("valid record flushed", || async {
        store.checkpoints().await.get(&0) == Some(&3)
    })
    .await;
    assert_eq!(stored(store.as_ref(), "acme").await.unwrap().total_requests, 1);

    handle.shutdown().await.unwrap();
    assert_eq!(broker.committed_offset(GROUP, 0).await, Some(4));
}

#[tokio::test]
async fn test_rebalance_discards_unflushed_state_and_replays() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 1);
    let producer = broker.producer();
    for latency in [1.0, 2.0, 3.0] {
        producer.send_message(&sample("acme", latency)).await.unwrap();
    }

    let aggregator = aggregator(store.clone(), HOUR);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));
    eventually("first pass applied", || async {
        aggregator.offsets().await.get(&0) == Some(&2)
    })
    .await;
    // First sample flushed (checkpoint 0), two more held in memory
    assert_eq!(store.checkpoints().await[&0], 0);
    let first_generation = aggregator.generation().await.unwrap();

    broker.rebalance(GROUP).await;
    eventually("replay after reload", || async {
        aggregator.generation().await != Some(first_generation)
            && aggregator.offsets().await.get(&0) == Some(&2)
    })
    .await;

    // Hydrated from the stored single sample, then records 1 and 2 replayed once
    assert_eq!(aggregator.key_stats("acme").await.unwrap().total_requests, 3);
    aggregator.flush_now().await.unwrap();
    let acme = stored(store.as_ref(), "acme").await.unwrap();
    assert_eq!(acme.total_requests, 3);
    assert!((acme.avg_latency - 2.0).abs() < 1e-9);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_reload_failure_falls_back_to_committed_offsets() {
    let store = Arc::new(MemoryStatsStore::new());
    store.fail_checkpoint_reads(true);
    let broker = MemoryBroker::new("statistics", 1);
    broker.producer().send_message(&sample("acme", 4.0)).await.unwrap();

    let aggregator = aggregator(store.clone(), Duration::ZERO);
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    eventually("sample flushed despite failed reload", || async {
        stored(store.as_ref(), "acme").await.is_some()
    })
    .await;
    assert_eq!(stored(store.as_ref(), "acme").await.unwrap().total_requests, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("keystats.db");
    let broker = MemoryBroker::new("statistics", 2);
    let producer = broker.producer();
    for latency in [1.0, 2.0, 3.0] {
        producer.send_message(&sample("acme", latency)).await.unwrap();
        producer.send_message(&sample("globex", latency)).await.unwrap();
    }

    {
        let store: Arc<dyn StatsStore> = Arc::new(SqliteStatsStore::new(&path).await.unwrap());
        let first = aggregator(store, HOUR);
        let handle = first.spawn(Arc::new(broker.join(GROUP).await));
        eventually("first run applied everything", || async {
            let acme = first.key_stats("acme").await;
            let globex = first.key_stats("globex").await;
            acme.map_or(false, |s| s.total_requests == 3)
                && globex.map_or(false, |s| s.total_requests == 3)
        })
        .await;
        handle.shutdown().await.unwrap();
    }

    // A group with no committed offsets would start from the beginning of every log;
    // the stored checkpoints must move it past everything already aggregated
    for latency in [4.0, 5.0] {
        producer.send_message(&sample("acme", latency)).await.unwrap();
    }
    let store: Arc<dyn StatsStore> = Arc::new(SqliteStatsStore::new(&path).await.unwrap());
    let second = aggregator(store.clone(), Duration::ZERO);
    let handle = second.spawn(Arc::new(broker.join("fresh-group").await));

    let acme_partition = partition_for_keystem("acme", 2);
    let acme_end = broker.end_offset(acme_partition).await - 1;
    eventually("second run caught up", || async {
        second.offsets().await.get(&acme_partition) == Some(&acme_end)
    })
    .await;
    handle.shutdown().await.unwrap();

    let acme = stored(store.as_ref(), "acme").await.unwrap();
    let globex = stored(store.as_ref(), "globex").await.unwrap();
    assert_eq!(acme.total_requests, 5);
    assert_eq!(globex.total_requests, 3);
    assert!((acme.avg_latency - 3.0).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_partitions_do_not_lose_updates() {
    const KEYSTEMS: usize = 40;
    const PER_KEYSTEM: usize = 25;

    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 4);
    let aggregator = aggregator(store.clone(), Duration::from_millis(5));
    let handle = aggregator.spawn(Arc::new(broker.join(GROUP).await));

    let mut producers = Vec::new();
    for worker in 0..4 {
        let producer = broker.producer();
        producers.push(tokio::spawn(async move {
            for i in 0..PER_KEYSTEM {
                for k in (worker..KEYSTEMS).step_by(4) {
                    let keystem = format!("key-{}", k);
                    producer
                        .send_message(&sample(&keystem, (i + 1) as f64))
                        .await
                        .unwrap();
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let mut ends = Vec::new();
    for partition in 0..4 {
        ends.push((partition, broker.end_offset(partition).await));
    }
    eventually("every partition drained", || async {
        let offsets = aggregator.offsets().await;
        ends.iter()
            .all(|(p, end)| *end == 0 || offsets.get(p) == Some(&(end - 1)))
    })
    .await;
    handle.shutdown().await.unwrap();

    let all = store.list_key_stats().await.unwrap();
    assert_eq!(all.len(), KEYSTEMS);
    for stats in &all {
        assert_eq!(stats.total_requests, PER_KEYSTEM as u64, "{}", stats.used_keystem);
        assert!((stats.avg_latency - 13.0).abs() < 1e-9);
        assert_eq!(stats.highest_latency.latency, PER_KEYSTEM as f64);
    }
    let rollup = store.cross_key_stats().await.unwrap();
    assert_eq!(rollup.total_requests, (KEYSTEMS * PER_KEYSTEM) as u64);
    assert_eq!(rollup.status_codes["200"], (KEYSTEMS * PER_KEYSTEM) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_surviving_member_takes_over_partitions() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 4);
    let producer = broker.producer();
    let keystems: Vec<String> = (0..12).map(|k| format!("tenant-{}", k)).collect();

    let a = aggregator(store.clone(), Duration::ZERO);
    let b = aggregator(store.clone(), Duration::ZERO);
    let group_a = Arc::new(broker.join(GROUP).await);
    let group_b = Arc::new(broker.join(GROUP).await);
    let handle_a = a.spawn(group_a);
    let handle_b = b.spawn(group_b.clone());

    for keystem in &keystems {
        producer.send_message(&sample(keystem, 2.0)).await.unwrap();
    }
    eventually("both members flushed their share", || async {
        let all = store.list_key_stats().await.unwrap();
        all.len() == keystems.len() && all.iter().all(|s| s.total_requests == 1)
    })
    .await;

    handle_a.shutdown().await.unwrap();

    for keystem in &keystems {
        producer.send_message(&sample(keystem, 4.0)).await.unwrap();
    }
    eventually("survivor applied the second round", || async {
        let all = store.list_key_stats().await.unwrap();
        all.iter().all(|s| s.total_requests == 2)
    })
    .await;

    for stats in store.list_key_stats().await.unwrap() {
        assert_eq!(stats.total_requests, 2);
        assert!((stats.avg_latency - 3.0).abs() < 1e-9);
    }

    handle_b.shutdown().await.unwrap();
    assert!(group_b.next_session().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_between_sessions_keeps_new_owner_checkpoint() {
    let store = Arc::new(MemoryStatsStore::new());
    let broker = MemoryBroker::new("statistics", 2);
    let producer = broker.producer();
    let moved = keystems_on(1, 2, 2);
    let (seen_by_a, only_b) = (&moved[0], &moved[1]);

    // A owns both partitions and flushes its view of partition 1
    let a = aggregator(store.clone(), Duration::ZERO);
    let handle_a = a.spawn(Arc::new(StalledRejoin::new(broker.join(GROUP).await)));
    producer.send_message(&sample(seen_by_a, 2.0)).await.unwrap();
    eventually("A flushed partition 1", || async {
        store.checkpoints().await.get(&1) == Some(&0)
    })
    .await;

    // B joins and takes partition 1; A's session ends and its rejoin stalls
    let b = aggregator(store.clone(), Duration::ZERO);
    let handle_b = b.spawn(Arc::new(broker.join(GROUP).await));
    eventually("A left its session", || async { a.generation().await.is_none() }).await;
    assert!(a.offsets().await.is_empty());

    producer.send_message(&sample(seen_by_a, 4.0)).await.unwrap();
    producer.send_message(&sample(only_b, 6.0)).await.unwrap();
    eventually("B flushed partition 1", || async {
        store.checkpoints().await.get(&1) == Some(&2)
    })
    .await;

    // A shuts down before it ever rejoined
    handle_a.shutdown().await.unwrap();
    assert_eq!(store.checkpoints().await[&1], 2);

    // A leaving moves B to a new generation, which reloads from the stored checkpoint
    producer.send_message(&sample(only_b, 8.0)).await.unwrap();
    eventually("B applied the record after reload", || async {
        store.checkpoints().await.get(&1) == Some(&3)
    })
    .await;

    let seen = stored(store.as_ref(), seen_by_a).await.unwrap();
    let only = stored(store.as_ref(), only_b).await.unwrap();
    assert_eq!(seen.total_requests, 2);
    assert!((seen.avg_latency - 3.0).abs() < 1e-9);
    assert_eq!(only.total_requests, 2);
    assert!((only.avg_latency - 7.0).abs() < 1e-9);

    handle_b.shutdown().await.unwrap();
}
