//! keystats REST API
//!
//! HTTP/JSON query surface over the stored aggregates, plus the producer-side entry points
//! that publish statistics samples and delete requests onto the queue.

use axum::{
    routing::{get, post},
    Router,
};
use keystats_consumer::RecordProducer;
use keystats_metadata::StatsStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod handlers;
pub mod models;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StatsStore>,
    pub producer: Arc<dyn RecordProducer>,
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/keydata/:keystem",
            get(handlers::keydata::get_key_data).delete(handlers::keydata::delete_key_data),
        )
        .route("/stats", post(handlers::stats::publish_sample))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(handlers::health::health_check))
        .merge(keystats_observability::exporter::create_metrics_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve `router` on `addr` until `shutdown` resolves.
pub async fn serve<F>(router: Router, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("REST API listening on {}", addr);
    tracing::info!("   Health: http://{}/health", addr);
    tracing::info!("   Metrics: http://{}/metrics", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
