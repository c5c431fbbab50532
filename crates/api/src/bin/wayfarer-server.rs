use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wayfarer_api::{AppState, Server};
use wayfarer_chat::{ChatEventRelay, ChatIngress, ChatService};
use wayfarer_common::SystemConfig;
use wayfarer_events::{BusMetrics, EventBus, RedisBroker};
use wayfarer_location::LocationService;
use wayfarer_realtime::ConnectionHub;
use wayfarer_storage::{PgChatStore, PgLocationStore, PgPushTokenStore, PgTripStore, TripStore};
use wayfarer_weather::{WeatherClient, WeatherService};
use wayfarer_workers::{PushClient, PushNotifier, WorkerPool};

#[derive(Parser)]
#[command(name = "wayfarer-server", about = "Trip event fabric server")]
struct Args {
    /// Path to a TOML config file; environment variables override it.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SystemConfig::load(path).context("loading config file")?,
        None => SystemConfig::from_env(),
    };
    let config = Arc::new(config);

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&config.storage.postgres_url)
        .await
        .context("connecting to postgres")?;
    let chat_store = Arc::new(PgChatStore::new(pool.clone()));
    let trip_store: Arc<dyn TripStore> = Arc::new(PgTripStore::new(pool.clone()));
    let location_store = Arc::new(PgLocationStore::new(pool.clone()));
    let push_tokens = Arc::new(PgPushTokenStore::new(pool));

    let broker = Arc::new(
        RedisBroker::connect(&config.bus.redis_url)
            .await
            .context("connecting to redis")?,
    );
    let bus = Arc::new(EventBus::new(
        broker,
        config.bus.clone(),
        Arc::new(BusMetrics::new()),
    ));
    info!(instance_id = %bus.instance_id(), "event bus ready");

    let hub = Arc::new(ConnectionHub::new());

    let worker_pool = Arc::new(WorkerPool::new(&config.workers));
    worker_pool.start().await;
    let notifier = Arc::new(PushNotifier::new(
        Arc::new(PushClient::new(&config.push)?),
        push_tokens,
        worker_pool.clone(),
    ));

    let chat = Arc::new(
        ChatService::new(chat_store, trip_store.clone(), bus.clone(), hub.clone())
            .with_push(notifier),
    );
    let ingress = Arc::new(ChatIngress::new(chat.clone(), hub.clone()));
    let relay = Arc::new(ChatEventRelay::new(bus.clone(), hub.clone()));

    let location = Arc::new(LocationService::new(
        location_store,
        trip_store.clone(),
        bus.clone(),
    ));
    let weather = Arc::new(WeatherService::new(
        bus.clone(),
        Arc::new(WeatherClient::new(config.weather.clone())?),
        &config.weather,
    ));

    let state = AppState {
        config,
        bus,
        hub,
        chat,
        ingress,
        relay,
        location,
        weather,
        trips: trip_store,
        pool: worker_pool,
    };

    Server::new(state).run().await
}
