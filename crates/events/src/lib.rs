//! Trip event bus.
//!
//! One logical channel per trip. Producers publish [`wayfarer_common::Event`]
//! envelopes; each websocket-connected (trip, user) pair holds one bounded
//! lazy subscription. The transport is abstracted behind [`Broker`]:
//! [`RedisBroker`] is the production implementation, [`MemoryBroker`] backs
//! tests and single-process runs.

pub mod broker;
pub mod bus;
pub mod metrics;
pub mod redis_broker;

pub use broker::{Broker, BrokerSubscription, FailingBroker, MemoryBroker};
pub use bus::{EventBus, EventSubscription};
pub use metrics::{BusMetrics, BusMetricsSnapshot};
pub use redis_broker::RedisBroker;
