//! Transport abstraction under the event bus.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wayfarer_common::{CoreError, Result};

/// Raw publish/subscribe transport. Payloads are opaque bytes; ordering is
/// preserved per channel.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Pipelined multi-publish to one channel. Write atomicity is
    /// best-effort; callers validate before calling.
    async fn publish_many(&self, channel: &str, payloads: Vec<Vec<u8>>) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription>;

    async fn ping(&self) -> Result<()>;
}

/// A live raw subscription. The stream ends when the underlying channel
/// closes or the subscription is dropped.
pub struct BrokerSubscription {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
}

impl BrokerSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Vec<u8>>, token: CancellationToken) -> Self {
        Self { receiver, token }
    }

    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// In-process broker over tokio broadcast channels. Used by tests and
/// single-node deployments; mirrors the redis broker's per-channel ordering.
pub struct MemoryBroker {
    channels: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        // A publish with no subscribers is not an error.
        let _ = self.sender(channel).await.send(payload);
        Ok(())
    }

    async fn publish_many(&self, channel: &str, payloads: Vec<Vec<u8>>) -> Result<()> {
        let sender = self.sender(channel).await;
        for payload in payloads {
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription> {
        let mut rx = self.sender(channel).await.subscribe();
        let (tx, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let pump_token = token.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(payload) => {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(channel = %channel, skipped, "memory broker receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(BrokerSubscription::new(receiver, token))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Broker that fails every operation; exercises transport error paths in
/// tests.
pub struct FailingBroker;

#[async_trait]
impl Broker for FailingBroker {
    async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<()> {
        Err(CoreError::transport("broker unavailable"))
    }

    async fn publish_many(&self, _channel: &str, _payloads: Vec<Vec<u8>>) -> Result<()> {
        Err(CoreError::transport("broker unavailable"))
    }

    async fn subscribe(&self, _channel: &str) -> Result<BrokerSubscription> {
        Err(CoreError::transport("broker unavailable"))
    }

    async fn ping(&self) -> Result<()> {
        Err(CoreError::transport("broker unavailable"))
    }
}
