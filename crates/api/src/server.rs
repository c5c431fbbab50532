use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::routes;
use crate::state::AppState;

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/ws/:trip_id", get(routes::ws::ws_handler))
            .route("/trips/:trip_id/location", post(routes::location::update_location))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until ctrl-c, then drain: relay, bus, weather loops, workers.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.state.config.server.bind_addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "server listening");

        let state = self.state.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await?;

        state.relay.shutdown().await;
        state.bus.shutdown().await;
        state.weather.shutdown();
        let deadline = Duration::from_secs(state.config.workers.shutdown_timeout_secs);
        if let Err(e) = state.pool.shutdown(deadline).await {
            tracing::warn!(error = %e, "worker pool shutdown incomplete");
        }
        info!("server stopped");
        Ok(())
    }
}
