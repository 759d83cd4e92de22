use crate::models::HealthResponse;
use axum::Json;

/// Returns 200 OK while the process is serving requests
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
