//! Location emitter: validates member location updates, persists the latest
//! fix, and publishes `location.updated` on the trip channel.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use wayfarer_common::{
    CoreError, Event, EventKind, LocationFix, LocationUpdate, Result, TripId, UserId,
};
use wayfarer_events::EventBus;
use wayfarer_storage::{LocationStore, TripStore};

pub struct LocationService {
    store: Arc<dyn LocationStore>,
    trip_store: Arc<dyn TripStore>,
    bus: Arc<EventBus>,
}

impl LocationService {
    pub fn new(
        store: Arc<dyn LocationStore>,
        trip_store: Arc<dyn TripStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            trip_store,
            bus,
        }
    }

    fn validate(update: &LocationUpdate) -> Result<()> {
        if !(-90.0..=90.0).contains(&update.latitude) {
            return Err(CoreError::validation(format!(
                "latitude {} out of range [-90, 90]",
                update.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&update.longitude) {
            return Err(CoreError::validation(format!(
                "longitude {} out of range [-180, 180]",
                update.longitude
            )));
        }
        if update.accuracy < 0.0 {
            return Err(CoreError::validation("accuracy must be non-negative"));
        }
        let now = Utc::now();
        if update.timestamp < now - Duration::hours(1)
            || update.timestamp > now + Duration::minutes(1)
        {
            return Err(CoreError::validation(
                "timestamp must lie within [now - 1h, now + 1min]",
            ));
        }
        Ok(())
    }

    /// Validate, persist, and announce a member's location update.
    ///
    /// A failed event publish is logged; the persisted fix is still
    /// returned to the caller.
    pub async fn update_location(
        &self,
        trip_id: &TripId,
        user_id: &UserId,
        update: LocationUpdate,
    ) -> Result<LocationFix> {
        let role = self.trip_store.get_user_role(trip_id, user_id).await?;
        if !role.is_member() {
            return Err(CoreError::forbidden(format!(
                "user {} is not a member of trip {}",
                user_id, trip_id
            )));
        }
        Self::validate(&update)?;

        let fix = LocationFix {
            id: Uuid::new_v4().to_string(),
            trip_id: trip_id.clone(),
            user_id: user_id.clone(),
            latitude: update.latitude,
            longitude: update.longitude,
            accuracy: update.accuracy,
            timestamp: update.timestamp,
        };
        self.store.upsert_latest(&fix).await?;

        let event = Event::new(
            EventKind::LocationUpdated,
            fix.trip_id.clone(),
            fix.user_id.clone(),
            serde_json::to_value(&fix)?,
        );
        if let Err(e) = self.bus.publish(event).await {
            warn!(trip_id = %trip_id, error = %e, "location event publish failed");
        }

        Ok(fix)
    }

    /// Latest fix per member, visible to trip members only.
    pub async fn list_member_locations(
        &self,
        trip_id: &TripId,
        requester_id: &UserId,
    ) -> Result<Vec<LocationFix>> {
        let role = self.trip_store.get_user_role(trip_id, requester_id).await?;
        if !role.is_member() {
            return Err(CoreError::forbidden(format!(
                "user {} is not a member of trip {}",
                requester_id, trip_id
            )));
        }
        self.store.list_latest(trip_id).await
    }
}
