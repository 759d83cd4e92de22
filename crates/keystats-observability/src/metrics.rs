use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Ingestion Metrics
    // ============================================================================

    /// Records routed, by message kind (`stats`, `delete`)
    pub static ref RECORDS_CONSUMED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keystats_records_consumed_total", "Total records applied to aggregates"),
        &["kind"]
    ).expect("metric can be created");

    /// Records handled without effect, by reason (`unknown_kind`, `decode_error`)
    pub static ref RECORDS_SKIPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keystats_records_skipped_total", "Total records skipped"),
        &["reason"]
    ).expect("metric can be created");

    /// Aggregate hydrations from the store on first touch of a keystem
    pub static ref HYDRATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keystats_hydrations_total", "Total keystem hydrations"),
        &["source"] // store, empty, error
    ).expect("metric can be created");

    /// Keystems currently held in memory
    pub static ref KEYSTEMS_TRACKED: IntGauge = IntGauge::new(
        "keystats_keystems_tracked",
        "Keystems held in the in-memory aggregate map"
    ).expect("metric can be created");

    // ============================================================================
    // Flush Metrics
    // ============================================================================

    /// Flush attempts by trigger and outcome
    pub static ref FLUSHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keystats_flushes_total", "Total flush attempts"),
        &["trigger", "outcome"] // outcome: ok, error, timeout
    ).expect("metric can be created");

    /// Flush transaction latency
    pub static ref FLUSH_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("keystats_flush_latency_seconds", "Flush transaction latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).expect("metric can be created");

    // ============================================================================
    // Consumer Group Metrics
    // ============================================================================

    /// Rebalances observed (generation changes)
    pub static ref REBALANCES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keystats_rebalances_total", "Total consumer group rebalances"),
        &["consumer_group"]
    ).expect("metric can be created");

    /// Checkpoint reads that failed during a rebalance reload
    pub static ref CHECKPOINT_RELOAD_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "keystats_checkpoint_reload_errors_total",
        "Total failed checkpoint reloads"
    ).expect("metric can be created");

    /// Partitions currently claimed by this process
    pub static ref PARTITIONS_CLAIMED: IntGauge = IntGauge::new(
        "keystats_partitions_claimed",
        "Partitions claimed in the current session"
    ).expect("metric can be created");

    // ============================================================================
    // Query Metrics
    // ============================================================================

    /// API requests by endpoint and status
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keystats_api_requests_total", "Total query API requests"),
        &["endpoint", "status"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(RECORDS_CONSUMED_TOTAL.clone()))
            .expect("records_consumed_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_SKIPPED_TOTAL.clone()))
            .expect("records_skipped_total can be registered");
        REGISTRY
            .register(Box::new(HYDRATIONS_TOTAL.clone()))
            .expect("hydrations_total can be registered");
        REGISTRY
            .register(Box::new(KEYSTEMS_TRACKED.clone()))
            .expect("keystems_tracked can be registered");

        REGISTRY
            .register(Box::new(FLUSHES_TOTAL.clone()))
            .expect("flushes_total can be registered");
        REGISTRY
            .register(Box::new(FLUSH_LATENCY.clone()))
            .expect("flush_latency can be registered");

        REGISTRY
            .register(Box::new(REBALANCES_TOTAL.clone()))
            .expect("rebalances_total can be registered");
        REGISTRY
            .register(Box::new(CHECKPOINT_RELOAD_ERRORS_TOTAL.clone()))
            .expect("checkpoint_reload_errors_total can be registered");
        REGISTRY
            .register(Box::new(PARTITIONS_CLAIMED.clone()))
            .expect("partitions_claimed can be registered");

        REGISTRY
            .register(Box::new(API_REQUESTS_TOTAL.clone()))
            .expect("api_requests_total can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"keystats_flush_latency_seconds".to_string()));
        assert!(names.contains(&"keystats_keystems_tracked".to_string()));
    }

    #[test]
    fn test_labelled_counters() {
        RECORDS_SKIPPED_TOTAL
            .with_label_values(&["test_reason"])
            .inc_by(3);
        FLUSHES_TOTAL
            .with_label_values(&["test_trigger", "ok"])
            .inc();

        assert_eq!(
            RECORDS_SKIPPED_TOTAL.with_label_values(&["test_reason"]).get(),
            3
        );
        assert_eq!(
            FLUSHES_TOTAL.with_label_values(&["test_trigger", "ok"]).get(),
            1
        );
    }
}
