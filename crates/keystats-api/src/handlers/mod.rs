//! API request handlers

pub mod health;
pub mod keydata;
pub mod stats;

use crate::models::ErrorResponse;
use axum::{http::StatusCode, Json};
use keystats_observability::metrics::API_REQUESTS_TOTAL;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn record(endpoint: &str, status: StatusCode) {
    API_REQUESTS_TOTAL
        .with_label_values(&[endpoint, status.as_str()])
        .inc();
}

pub(crate) fn error(
    endpoint: &str,
    status: StatusCode,
    error: &str,
    message: impl Into<String>,
) -> ApiError {
    record(endpoint, status);
    (status, Json(ErrorResponse::new(error, message)))
}
