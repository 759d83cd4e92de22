//! keystats Observability
//!
//! Prometheus metrics for the aggregation engine and the `/metrics` exporter.
//!
//! # Usage
//!
//! ```no_run
//! use keystats_observability::{exporter, metrics};
//!
//! metrics::init();
//! let metrics_router: axum::Router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
