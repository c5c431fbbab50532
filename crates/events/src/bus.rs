//! The event bus: validation, per-(trip, user) subscriptions, fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerSubscription};
use crate::metrics::BusMetrics;
use wayfarer_common::{BusSettings, CoreError, Event, EventKind, Result, TripId, UserId};

type SubscriptionKey = (TripId, UserId);

struct ActiveSubscription {
    seq: u64,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// One live consumer of a trip channel.
///
/// Events arrive in publish order, bounded by the bus buffer size; events
/// past the buffer are dropped, never queued. Dropping or cancelling the
/// subscription closes the sequence.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::Receiver<Event>,
    token: CancellationToken,
}

impl EventSubscription {
    /// Next event, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Publish/subscribe front end over a [`Broker`], keyed per trip.
///
/// At most one live subscription exists per (trip, user); a second
/// subscribe closes and replaces the first. A slow consumer never stalls
/// the broker link: its events are dropped and counted instead.
pub struct EventBus {
    broker: Arc<dyn Broker>,
    settings: BusSettings,
    metrics: Arc<BusMetrics>,
    subscriptions: Arc<RwLock<HashMap<SubscriptionKey, ActiveSubscription>>>,
    /// Identity of this process, stamped into `metadata.source`.
    instance_id: String,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>, settings: BusSettings, metrics: Arc<BusMetrics>) -> Self {
        Self {
            broker,
            settings,
            metrics,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            instance_id: Uuid::new_v4().to_string(),
            next_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    pub fn channel_name(trip_id: &TripId) -> String {
        format!("trip-events:{}", trip_id)
    }

    /// Validate and auto-fill an event before it goes on the wire.
    fn prepare(&self, mut event: Event) -> Result<Event> {
        if event.kind.as_str().is_empty() {
            return Err(CoreError::validation("event type must not be empty"));
        }
        if event.trip_id.as_str().is_empty() {
            return Err(CoreError::validation("event trip id must not be empty"));
        }
        if event.id.is_nil() {
            event.id = Uuid::new_v4();
        }
        if event.version == 0 {
            event.version = 1;
        }
        if event.metadata.source.is_empty() {
            event.metadata.source = self.instance_id.clone();
        }
        Ok(event)
    }

    /// Publish one event on its trip channel.
    ///
    /// Bounded by the publish timeout; timeouts and broker failures surface
    /// as `Transport`. Telemetry is recorded on every outcome.
    pub async fn publish(&self, event: Event) -> Result<()> {
        let event = self.prepare(event)?;
        let kind = event.kind.as_str().to_string();
        let channel = Self::channel_name(&event.trip_id);
        let payload = serde_json::to_vec(&event)?;

        let started = Instant::now();
        let result = match timeout(
            Duration::from_secs(self.settings.publish_timeout_secs),
            self.broker.publish(&channel, payload),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(CoreError::transport(format!(
                "publish to {} timed out after {}s",
                channel, self.settings.publish_timeout_secs
            ))),
        };

        self.metrics
            .record_publish(&kind, started.elapsed(), result.is_ok());
        result
    }

    /// Publish a batch of events for one trip.
    ///
    /// Atomic at the validator: any invalid event fails the whole batch
    /// before a single byte is written. The pipelined broker write itself is
    /// best-effort.
    pub async fn publish_batch(&self, trip_id: &TripId, events: Vec<Event>) -> Result<()> {
        let channel = Self::channel_name(trip_id);
        let mut payloads = Vec::with_capacity(events.len());
        let mut kinds = Vec::with_capacity(events.len());
        for event in events {
            let event = self.prepare(event)?;
            if &event.trip_id != trip_id {
                return Err(CoreError::validation(format!(
                    "batch event {} targets trip {}, expected {}",
                    event.id, event.trip_id, trip_id
                )));
            }
            kinds.push(event.kind.as_str().to_string());
            payloads.push(serde_json::to_vec(&event)?);
        }

        let started = Instant::now();
        let result = match timeout(
            Duration::from_secs(self.settings.publish_timeout_secs),
            self.broker.publish_many(&channel, payloads),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(CoreError::transport(format!(
                "batch publish to {} timed out",
                channel
            ))),
        };

        let elapsed = started.elapsed();
        for kind in &kinds {
            self.metrics.record_publish(kind, elapsed, result.is_ok());
        }
        result
    }

    /// Open a subscription for (trip, user), replacing any previous one.
    ///
    /// Empty `filters` admits every event type; otherwise events outside the
    /// set are discarded before they occupy buffer slots.
    pub async fn subscribe(
        &self,
        trip_id: &TripId,
        user_id: &UserId,
        filters: Vec<EventKind>,
    ) -> Result<EventSubscription> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::transport("event bus is shut down"));
        }

        let key = (trip_id.clone(), user_id.clone());

        // Close the previous subscription for this pair before replacing it.
        let previous = self.subscriptions.write().await.remove(&key);
        if let Some(prev) = previous {
            self.close_subscription(&key, prev).await;
        }

        let channel = Self::channel_name(trip_id);
        let broker_sub = match timeout(
            Duration::from_secs(self.settings.subscribe_timeout_secs),
            self.broker.subscribe(&channel),
        )
        .await
        {
            Ok(Ok(sub)) => sub,
            Ok(Err(e)) => {
                return Err(CoreError::transport(format!(
                    "subscribe to {} failed: {}",
                    channel, e
                )))
            }
            Err(_) => {
                return Err(CoreError::transport(format!(
                    "subscribe to {} timed out after {}s",
                    channel, self.settings.subscribe_timeout_secs
                )))
            }
        };

        let (tx, receiver) = mpsc::channel(self.settings.buffer_size);
        let token = self.shutdown.child_token();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(Self::pump(
            broker_sub,
            tx,
            filters,
            token.clone(),
            self.metrics.clone(),
            self.subscriptions.clone(),
            key.clone(),
            seq,
        ));

        let mut subscriptions = self.subscriptions.write().await;
        if let Some(displaced) = subscriptions.insert(key, ActiveSubscription { seq, token: token.clone(), handle }) {
            // A concurrent subscribe for the same pair raced us; the loser
            // is cancelled so at most one sequence stays live.
            displaced.token.cancel();
        }
        drop(subscriptions);

        debug!(trip_id = %trip_id, user_id = %user_id, "subscription established");
        Ok(EventSubscription { receiver, token })
    }

    /// Forwards raw broker messages into the consumer buffer, applying
    /// filters and the drop-on-full policy.
    #[allow(clippy::too_many_arguments)]
    async fn pump(
        mut broker_sub: BrokerSubscription,
        tx: mpsc::Sender<Event>,
        filters: Vec<EventKind>,
        token: CancellationToken,
        metrics: Arc<BusMetrics>,
        subscriptions: Arc<RwLock<HashMap<SubscriptionKey, ActiveSubscription>>>,
        key: SubscriptionKey,
        seq: u64,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = broker_sub.next() => {
                    let Some(bytes) = msg else {
                        // Underlying broker channel closed; close the
                        // sequence cleanly.
                        break;
                    };
                    let event: Event = match serde_json::from_slice(&bytes) {
                        Ok(event) => event,
                        Err(e) => {
                            metrics.record_decode_error();
                            warn!(trip_id = %key.0, error = %e, "skipping undecodable bus message");
                            continue;
                        }
                    };
                    if !filters.is_empty() && !filters.contains(&event.kind) {
                        continue;
                    }
                    match tx.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            metrics.record_dropped();
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
        }

        // Remove our own map entry unless a replacement already took the key.
        let mut subscriptions = subscriptions.write().await;
        if subscriptions.get(&key).map(|s| s.seq) == Some(seq) {
            subscriptions.remove(&key);
        }
    }

    async fn close_subscription(&self, key: &SubscriptionKey, sub: ActiveSubscription) {
        sub.token.cancel();
        let unsubscribe_timeout = Duration::from_secs(self.settings.unsubscribe_timeout_secs);
        if timeout(unsubscribe_timeout, sub.handle).await.is_err() {
            warn!(trip_id = %key.0, user_id = %key.1, "subscription pump did not stop in time");
        }
    }

    /// Close the subscription for (trip, user) if one exists.
    pub async fn unsubscribe(&self, trip_id: &TripId, user_id: &UserId) {
        let key = (trip_id.clone(), user_id.clone());
        let removed = self.subscriptions.write().await.remove(&key);
        if let Some(sub) = removed {
            self.close_subscription(&key, sub).await;
            debug!(trip_id = %trip_id, user_id = %user_id, "unsubscribed");
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Cancel every subscription and wait for the pumps to drain.
    /// Idempotent; later calls find nothing to do.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(SubscriptionKey, ActiveSubscription)> =
            self.subscriptions.write().await.drain().collect();
        let count = drained.len();
        for (key, sub) in drained {
            self.close_subscription(&key, sub).await;
        }
        if count > 0 {
            info!(subscriptions = count, "event bus shut down");
        }
    }

    /// Liveness probe against the broker.
    pub async fn ping(&self) -> Result<()> {
        self.broker.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn bus() -> EventBus {
        EventBus::new(
            Arc::new(MemoryBroker::new()),
            BusSettings::default(),
            Arc::new(BusMetrics::new()),
        )
    }

    #[test]
    fn channel_name_is_stable() {
        assert_eq!(
            EventBus::channel_name(&TripId::from("t-9")),
            "trip-events:t-9"
        );
    }

    #[tokio::test]
    async fn prepare_fills_missing_fields() {
        let bus = bus();
        let mut event = Event::new(
            EventKind::TripUpdated,
            TripId::from("t1"),
            UserId::from("u1"),
            serde_json::Value::Null,
        );
        event.id = Uuid::nil();
        event.version = 0;

        let prepared = bus.prepare(event).unwrap();
        assert!(!prepared.id.is_nil());
        assert_eq!(prepared.version, 1);
        assert_eq!(prepared.metadata.source, bus.instance_id());
    }

    #[tokio::test]
    async fn prepare_rejects_empty_trip() {
        let bus = bus();
        let event = Event::new(
            EventKind::TripUpdated,
            TripId::from(""),
            UserId::from("u1"),
            serde_json::Value::Null,
        );
        assert_eq!(bus.prepare(event).unwrap_err().kind(), "validation");
    }
}
