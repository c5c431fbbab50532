pub mod health;
pub mod location;
pub mod ws;

use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use wayfarer_common::CoreError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
}

/// Map the core taxonomy to HTTP status + error body.
pub fn error_response(e: &CoreError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match e.kind() {
        "validation" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "forbidden" => StatusCode::FORBIDDEN,
        "conflict" => StatusCode::CONFLICT,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "transport" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.kind().to_string(),
            timestamp: Utc::now(),
        }),
    )
}
