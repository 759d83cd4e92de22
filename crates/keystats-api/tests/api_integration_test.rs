//! Integration tests for the keystats REST API
//!
//! Builds the real router over an in-memory store and an in-process broker, then sends
//! requests via tower::ServiceExt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use keystats_api::{create_router, AppState};
use keystats_consumer::{ConsumerError, MemoryBroker, RecordProducer};
use keystats_core::{partition_for_keystem, KeyStats, MessageKind, Sample};
use keystats_metadata::{
    FlushBatch, FlushReceipt, MemoryStatsStore, MetadataError, StatsStore,
};

const PARTITIONS: u32 = 4;

fn stats_for(keystem: &str, latencies: &[f64]) -> KeyStats {
    let mut stats = KeyStats::new(keystem);
    for latency in latencies {
        let mut sample = Sample::new(keystem);
        sample.latency = *latency;
        sample.status_code = "200".to_string();
        sample.total_items = 3;
        stats.apply(&sample);
    }
    stats
}

async fn seeded_store() -> Arc<MemoryStatsStore> {
    let store = Arc::new(MemoryStatsStore::new());
    let offsets = HashMap::from([(0, 41)]);
    let key_stats = HashMap::from([
        ("acme".to_string(), stats_for("acme", &[10.0, 30.0])),
        ("globex".to_string(), stats_for("globex", &[50.0])),
    ]);
    store
        .write_flush(FlushBatch::new(&offsets, &key_stats))
        .await
        .unwrap();
    store
}

fn app(store: Arc<dyn StatsStore>, producer: Arc<dyn RecordProducer>) -> axum::Router {
    create_router(AppState { store, producer })
}

async fn body_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

struct UnavailableStore;

#[async_trait]
impl StatsStore for UnavailableStore {
    async fn get_checkpoints(&self, _: &[i32]) -> keystats_metadata::Result<HashMap<i32, i64>> {
        Err(MetadataError::Unavailable("down".to_string()))
    }

    async fn get_key_stats(
        &self,
        _: &[String],
    ) -> keystats_metadata::Result<HashMap<String, KeyStats>> {
        Err(MetadataError::Unavailable("down".to_string()))
    }

    async fn list_key_stats(&self) -> keystats_metadata::Result<Vec<KeyStats>> {
        Err(MetadataError::Unavailable("down".to_string()))
    }

    async fn write_flush(&self, _: FlushBatch<'_>) -> keystats_metadata::Result<FlushReceipt> {
        Err(MetadataError::Unavailable("down".to_string()))
    }
}

struct DisconnectedProducer;

#[async_trait]
impl RecordProducer for DisconnectedProducer {
    async fn send(
        &self,
        _: MessageKind,
        _: &str,
        _: Vec<u8>,
    ) -> keystats_consumer::Result<(i32, i64)> {
        Err(ConsumerError::Queue("broker unreachable".to_string()))
    }
}

// ---------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------

#[tokio::test]
async fn test_health_check() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));

    let resp = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp.into_body()).await["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    keystats_observability::init();
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));

    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("keystats_"));
}

// ---------------------------------------------------------------
// Queries
// ---------------------------------------------------------------

#[tokio::test]
async fn test_get_key_data() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));

    let resp = app.oneshot(get("/api/keydata/acme")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp.into_body()).await;
    assert_eq!(json["usedKeystem"], "acme");
    assert_eq!(json["totalRequests"], 2);
    assert_eq!(json["totalItems"], 6);
    assert_eq!(json["avgLatency"], 20.0);
    assert_eq!(json["maxLatency"]["latency"], 30.0);
    assert_eq!(json["statusCodes"]["200"], 2);
}

#[tokio::test]
async fn test_get_unknown_keystem_is_not_found() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));

    let resp = app.oneshot(get("/api/keydata/initech")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp.into_body()).await["error"], "not_found");
}

#[tokio::test]
async fn test_get_all_returns_rollup() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));

    let resp = app.oneshot(get("/api/keydata/all")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp.into_body()).await;
    assert_eq!(json["totalRequests"], 3);
    assert_eq!(json["avgLatency"], 30.0);
    assert_eq!(json["maxLatency"]["usedKeystem"], "globex");
    assert_eq!(json["maxLatency"]["latency"], 50.0);
    assert_eq!(json["highestAvgLatency"]["usedKeystem"], "globex");
}

#[tokio::test]
async fn test_get_all_on_empty_store() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(Arc::new(MemoryStatsStore::new()), Arc::new(broker.producer()));

    let resp = app.oneshot(get("/api/keydata/all")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp.into_body()).await;
    assert_eq!(json["totalRequests"], 0);
    assert_eq!(json["avgLatency"], 0.0);
}

#[tokio::test]
async fn test_store_failure_is_internal_error() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(Arc::new(UnavailableStore), Arc::new(broker.producer()));

    let resp = app
        .clone()
        .oneshot(get("/api/keydata/acme"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(resp.into_body()).await;
    assert_eq!(json["error"], "store_error");
    assert!(json["message"].as_str().unwrap().contains("down"));

    let resp = app.oneshot(get("/api/keydata/all")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

// ---------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------

#[tokio::test]
async fn test_delete_publishes_request() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/keydata/acme")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let json = body_json(resp.into_body()).await;
    assert_eq!(json["message"], "delete request sent on keystem acme");
    assert_eq!(
        broker
            .end_offset(partition_for_keystem("acme", PARTITIONS))
            .await,
        1
    );
}

#[tokio::test]
async fn test_delete_with_producer_down_is_unavailable() {
    let app = app(seeded_store().await, Arc::new(DisconnectedProducer));

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/keydata/acme")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(resp.into_body()).await["error"], "producer_error");
}

#[tokio::test]
async fn test_publish_sample() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));
    let body = serde_json::json!({
        "usedKeystem": "initech",
        "totalItems": 4,
        "statusCode": "200",
        "latency": 12.5
    });

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/stats")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let partition = partition_for_keystem("initech", PARTITIONS);
    assert_eq!(broker.end_offset(partition).await, 1);
}

#[tokio::test]
async fn test_publish_sample_requires_keystem() {
    let broker = MemoryBroker::new("statistics", PARTITIONS);
    let app = app(seeded_store().await, Arc::new(broker.producer()));

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/stats")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"latency": 3.0}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    for partition in 0..PARTITIONS as i32 {
        assert_eq!(broker.end_offset(partition).await, 0);
    }
}
