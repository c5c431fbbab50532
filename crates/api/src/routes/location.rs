//! Thin ingress for member location updates.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;

use wayfarer_common::{LocationFix, LocationUpdate, TripId, UserId};

use crate::routes::{error_response, ErrorResponse};
use crate::state::AppState;

pub async fn update_location(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<LocationUpdate>,
) -> Result<Json<LocationFix>, (StatusCode, Json<ErrorResponse>)> {
    let Some(user_id) = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
        .map(UserId::from)
    else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "missing x-user-id header".to_string(),
                code: "unauthorized".to_string(),
                timestamp: chrono::Utc::now(),
            }),
        ));
    };

    let fix = state
        .location
        .update_location(&TripId::from(trip_id), &user_id, update)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(fix))
}
