//! Bus telemetry. Injected at construction; no process-wide registry.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters recorded by the bus on every publish and on subscriber
/// buffer drops / decode failures.
#[derive(Default)]
pub struct BusMetrics {
    published: AtomicU64,
    publish_errors: AtomicU64,
    publish_latency_micros: AtomicU64,
    dropped_events: AtomicU64,
    decode_errors: AtomicU64,
    published_by_type: DashMap<String, u64>,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, kind: &str, latency: Duration, ok: bool) {
        if ok {
            self.published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.publish_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        *self.published_by_type.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            publish_latency_micros: self.publish_latency_micros.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            published_by_type: self
                .published_by_type
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub publish_errors: u64,
    pub publish_latency_micros: u64,
    pub dropped_events: u64,
    pub decode_errors: u64,
    pub published_by_type: std::collections::HashMap<String, u64>,
}
