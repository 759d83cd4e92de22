use axum::{extract::State, http::StatusCode, Json};
use keystats_consumer::RecordProducer;
use keystats_core::{Message, Sample};

use super::{error, record, ApiError};
use crate::{models::MessageResponse, AppState};

/// `POST /api/stats`
///
/// Publishes one statistics sample onto the keystem's partition.
pub async fn publish_sample(
    State(state): State<AppState>,
    Json(sample): Json<Sample>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    const ENDPOINT: &str = "publish_stats";

    if sample.used_keystem.is_empty() {
        return Err(error(
            ENDPOINT,
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "usedKeystem is required",
        ));
    }

    let keystem = sample.used_keystem.clone();
    let (partition, offset) = state
        .producer
        .send_message(&Message::Stats(sample))
        .await
        .map_err(|e| {
            tracing::error!(keystem = %keystem, error = %e, "Failed to publish sample");
            error(
                ENDPOINT,
                StatusCode::SERVICE_UNAVAILABLE,
                "producer_error",
                format!("failed to send stats: {}", e),
            )
        })?;

    tracing::debug!(keystem = %keystem, partition, offset, "Sample sent");
    record(ENDPOINT, StatusCode::ACCEPTED);
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("stats sent on keystem {}", keystem),
        }),
    ))
}
