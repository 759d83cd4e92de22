//! Aggregate query and reset endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use keystats_consumer::RecordProducer;
use keystats_core::{DeleteRequest, Message};

use super::{error, record, ApiError};
use crate::{models::MessageResponse, AppState};

/// Path segment that selects the rollup over every keystem.
pub const ALL_KEYSTEMS: &str = "all";

/// `GET /api/keydata/:keystem`
///
/// Returns the stored aggregate for one keystem, or the cross-keystem rollup for `all`.
/// Reads the store, so aggregates still held in memory by the engine are not visible
/// until the next flush.
pub async fn get_key_data(
    State(state): State<AppState>,
    Path(keystem): Path<String>,
) -> Result<Response, ApiError> {
    const ENDPOINT: &str = "get_keydata";

    if keystem == ALL_KEYSTEMS {
        let rollup = state.store.cross_key_stats().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to compute cross-keystem stats");
            error(
                ENDPOINT,
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                format!("error encountered while fetching stats: {}", e),
            )
        })?;
        record(ENDPOINT, StatusCode::OK);
        return Ok(Json(rollup).into_response());
    }

    let mut found = state
        .store
        .get_key_stats(std::slice::from_ref(&keystem))
        .await
        .map_err(|e| {
            tracing::error!(keystem = %keystem, error = %e, "Failed to fetch key stats");
            error(
                ENDPOINT,
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                format!("error encountered while fetching stats: {}", e),
            )
        })?;

    match found.remove(&keystem) {
        Some(stats) => {
            record(ENDPOINT, StatusCode::OK);
            Ok(Json(stats).into_response())
        }
        None => Err(error(
            ENDPOINT,
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no stats stored for keystem {}", keystem),
        )),
    }
}

/// `DELETE /api/keydata/:keystem`
///
/// Publishes a delete request. The reset happens asynchronously when the engine
/// consumes it, hence `202 Accepted`.
pub async fn delete_key_data(
    State(state): State<AppState>,
    Path(keystem): Path<String>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    const ENDPOINT: &str = "delete_keydata";

    let message = Message::Delete(DeleteRequest::new(keystem.clone()));
    let (partition, offset) = state.producer.send_message(&message).await.map_err(|e| {
        tracing::error!(keystem = %keystem, error = %e, "Failed to publish delete request");
        error(
            ENDPOINT,
            StatusCode::SERVICE_UNAVAILABLE,
            "producer_error",
            format!("failed to send delete request: {}", e),
        )
    })?;

    tracing::info!(keystem = %keystem, partition, offset, "Delete request sent");
    record(ENDPOINT, StatusCode::ACCEPTED);
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("delete request sent on keystem {}", keystem),
        }),
    ))
}
