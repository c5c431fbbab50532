//! Weather emitter: a reference-counted refresh loop per trip.
//!
//! The first subscriber for a trip starts its loop; the loop fires
//! immediately, then on the configured interval, publishing
//! `weather.updated` on the trip channel. The last unsubscribe stops it.
//! Network failures are logged and never stop a loop.

pub mod client;

pub use client::{Forecast, WeatherClient};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wayfarer_common::{
    Coordinates, Destination, Event, EventKind, Result, TripId, UserId, WeatherSettings,
    WeatherSnapshot,
};
use wayfarer_events::EventBus;

struct TripLoop {
    subscribers: usize,
    token: CancellationToken,
    refresh_tx: mpsc::Sender<()>,
}

pub struct WeatherService {
    bus: Arc<EventBus>,
    client: Arc<WeatherClient>,
    loops: DashMap<TripId, TripLoop>,
    interval: Duration,
}

impl WeatherService {
    pub fn new(bus: Arc<EventBus>, client: Arc<WeatherClient>, settings: &WeatherSettings) -> Self {
        Self {
            bus,
            client,
            loops: DashMap::new(),
            interval: Duration::from_secs(settings.refresh_interval_secs.max(1)),
        }
    }

    /// Count a subscriber for the trip, starting the refresh loop on the
    /// first one.
    pub fn increment_subscribers(&self, trip_id: &TripId, destination: Destination) {
        match self.loops.entry(trip_id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().subscribers += 1;
            }
            Entry::Vacant(entry) => {
                let token = CancellationToken::new();
                let (refresh_tx, refresh_rx) = mpsc::channel(1);

                tokio::spawn(run_loop(
                    self.bus.clone(),
                    self.client.clone(),
                    trip_id.clone(),
                    destination,
                    self.interval,
                    token.clone(),
                    refresh_rx,
                ));

                entry.insert(TripLoop {
                    subscribers: 1,
                    token,
                    refresh_tx,
                });
                info!(trip_id = %trip_id, "weather loop started");
            }
        }
    }

    /// Drop a subscriber; the loop stops when the count reaches zero.
    pub fn decrement_subscribers(&self, trip_id: &TripId) {
        if let Entry::Occupied(mut entry) = self.loops.entry(trip_id.clone()) {
            let remaining = entry.get().subscribers.saturating_sub(1);
            entry.get_mut().subscribers = remaining;
            if remaining == 0 {
                let (_, trip_loop) = entry.remove_entry();
                trip_loop.token.cancel();
                info!(trip_id = %trip_id, "weather loop stopped");
            }
        }
    }

    /// Force an out-of-cycle refresh, e.g. after a destination change.
    pub fn trigger_immediate_update(&self, trip_id: &TripId) {
        if let Some(trip_loop) = self.loops.get(trip_id) {
            // A refresh already queued is refresh enough.
            let _ = trip_loop.refresh_tx.try_send(());
        }
    }

    pub fn active_trips(&self) -> usize {
        self.loops.len()
    }

    /// Cancel every refresh loop.
    pub fn shutdown(&self) {
        let trips: Vec<TripId> = self.loops.iter().map(|e| e.key().clone()).collect();
        for trip_id in trips {
            if let Some((_, trip_loop)) = self.loops.remove(&trip_id) {
                trip_loop.token.cancel();
            }
        }
    }
}

async fn run_loop(
    bus: Arc<EventBus>,
    client: Arc<WeatherClient>,
    trip_id: TripId,
    destination: Destination,
    interval: Duration,
    token: CancellationToken,
    mut refresh_rx: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Geocode once and reuse across refreshes.
    let mut coordinates = destination.coordinates;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            // First tick fires immediately.
            _ = ticker.tick() => {
                refresh(&bus, &client, &trip_id, &destination, &mut coordinates).await;
            }
            Some(()) = refresh_rx.recv() => {
                refresh(&bus, &client, &trip_id, &destination, &mut coordinates).await;
            }
        }
    }
    debug!(trip_id = %trip_id, "weather loop exited");
}

async fn refresh(
    bus: &EventBus,
    client: &WeatherClient,
    trip_id: &TripId,
    destination: &Destination,
    coordinates: &mut Option<Coordinates>,
) {
    let coords = match coordinates {
        Some(coords) => *coords,
        None => match client.geocode(&destination.address).await {
            Ok(coords) => {
                *coordinates = Some(coords);
                coords
            }
            Err(e) => {
                warn!(trip_id = %trip_id, address = %destination.address, error = %e,
                      "geocoding failed; will retry next cycle");
                return;
            }
        },
    };

    let forecast = match client.forecast(&coords).await {
        Ok(forecast) => forecast,
        Err(e) => {
            warn!(trip_id = %trip_id, error = %e, "forecast fetch failed; will retry next cycle");
            return;
        }
    };

    let snapshot = WeatherSnapshot {
        trip_id: trip_id.clone(),
        current_temp: forecast.current_temp,
        weather_code: forecast.weather_code,
        updated_at: Utc::now(),
        hourly: forecast.hourly,
    };

    if let Err(e) = publish_snapshot(bus, trip_id, &snapshot).await {
        warn!(trip_id = %trip_id, error = %e, "weather event publish failed");
    }
}

async fn publish_snapshot(bus: &EventBus, trip_id: &TripId, snapshot: &WeatherSnapshot) -> Result<()> {
    let event = Event::new(
        EventKind::WeatherUpdated,
        trip_id.clone(),
        UserId::from("weather"),
        serde_json::to_value(snapshot)?,
    );
    bus.publish(event).await
}
