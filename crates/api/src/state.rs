use std::sync::Arc;

use wayfarer_chat::{ChatEventRelay, ChatIngress, ChatService};
use wayfarer_common::SystemConfig;
use wayfarer_events::EventBus;
use wayfarer_location::LocationService;
use wayfarer_realtime::ConnectionHub;
use wayfarer_storage::TripStore;
use wayfarer_weather::WeatherService;
use wayfarer_workers::WorkerPool;

/// Shared handles for every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SystemConfig>,
    pub bus: Arc<EventBus>,
    pub hub: Arc<ConnectionHub>,
    pub chat: Arc<ChatService>,
    pub ingress: Arc<ChatIngress>,
    pub relay: Arc<ChatEventRelay>,
    pub location: Arc<LocationService>,
    pub weather: Arc<WeatherService>,
    pub trips: Arc<dyn TripStore>,
    pub pool: Arc<WorkerPool>,
}
