use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub bus: &'static str,
    pub subscriptions: usize,
    pub weather_loops: usize,
    pub timestamp: DateTime<Utc>,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let bus_ok = state.bus.ping().await.is_ok();
    let response = HealthResponse {
        status: if bus_ok { "ok" } else { "degraded" },
        bus: if bus_ok { "up" } else { "down" },
        subscriptions: state.bus.subscription_count().await,
        weather_loops: state.weather.active_trips(),
        timestamp: Utc::now(),
    };
    let status = if bus_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
