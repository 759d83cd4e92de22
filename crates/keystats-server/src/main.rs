//! keystats server
//!
//! Runs the aggregation engine and the query API in one process.
//!
//! ## Configuration
//! All configuration is done via environment variables:
//!
//! - `KEYSTATS_DB`: SQLite database path (default: ./data/keystats.db)
//! - `KEYSTATS_API_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
//! - `KEYSTATS_GROUP_ID`: consumer group (default: aggregators)
//! - `KEYSTATS_TOPIC`: statistics topic (default: statistics)
//! - `KEYSTATS_FLUSH_INTERVAL_SECS`: minimum seconds between sample-triggered flushes (default: 5)
//! - `KEYSTATS_FLUSH_TIMEOUT_SECS`: flush transaction timeout (default: 30)
//! - `KEYSTATS_PARTITIONS`: partitions of the in-process topic (default: 8)
//! - `KEYSTATS_BROKERS`: Kafka bootstrap servers; requires the `kafka` feature
//!
//! Without `KEYSTATS_BROKERS` the server runs in local mode: an in-process broker carries
//! the samples published through `POST /api/stats` and delete requests.
//!
//! ## Logging
//! ```bash
//! RUST_LOG=debug cargo run -p keystats-server
//! ```

use keystats_api::{create_router, AppState};
use keystats_consumer::{Aggregator, ConsumerGroup, MemoryBroker, RecordProducer};
use keystats_metadata::{SqliteStatsStore, StatsStore};
use keystats_server::{shutdown_signal, ServerConfig};
use std::sync::Arc;

type Queue = (Arc<dyn ConsumerGroup>, Arc<dyn RecordProducer>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    keystats_observability::init();

    let config = ServerConfig::from_env()?;

    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    tracing::info!("Opening stats store at {}", config.db_path.display());
    let store: Arc<dyn StatsStore> = Arc::new(SqliteStatsStore::new(&config.db_path).await?);

    let (group, producer) = match config.brokers.as_deref() {
        Some(brokers) => kafka_queue(brokers, &config)?,
        None => local_queue(&config).await,
    };

    let aggregator = Aggregator::builder()
        .config(config.aggregator.clone())
        .store(Arc::clone(&store))
        .build()?;
    let handle = aggregator.spawn(group);

    let router = create_router(AppState { store, producer });
    let served = keystats_api::serve(router, config.api_addr, shutdown_signal()).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "API server failed");
    }

    tracing::info!("Stopping aggregator, running final flush");
    handle.shutdown().await?;
    served?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn local_queue(config: &ServerConfig) -> Queue {
    tracing::info!(
        topic = %config.aggregator.topic,
        partitions = config.partitions,
        "Using in-process broker"
    );
    let broker = MemoryBroker::new(config.aggregator.topic.clone(), config.partitions);
    let group = broker.join(config.aggregator.group_id.clone()).await;
    (Arc::new(group), Arc::new(broker.producer()))
}

#[cfg(feature = "kafka")]
fn kafka_queue(brokers: &str, config: &ServerConfig) -> anyhow::Result<Queue> {
    use keystats_consumer::{KafkaConsumerGroup, KafkaProducer};

    tracing::info!(brokers, topic = %config.aggregator.topic, "Using Kafka");
    let group = KafkaConsumerGroup::new(brokers, &config.aggregator.group_id, &config.aggregator.topic)?;
    let producer = KafkaProducer::new(brokers, &config.aggregator.topic)?;
    Ok((Arc::new(group), Arc::new(producer)))
}

#[cfg(not(feature = "kafka"))]
fn kafka_queue(_brokers: &str, _config: &ServerConfig) -> anyhow::Result<Queue> {
    anyhow::bail!("KEYSTATS_BROKERS is set but this build has no Kafka support (enable the `kafka` feature)")
}
