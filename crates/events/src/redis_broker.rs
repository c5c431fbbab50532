//! Redis pub/sub implementation of [`Broker`].

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerSubscription};
use wayfarer_common::{CoreError, Result};

fn redis_err(context: &str, e: redis::RedisError) -> CoreError {
    CoreError::transport(format!("{}: {}", context, e))
}

/// Redis-backed broker. Publishes go over a shared multiplexed connection;
/// each subscription holds its own pub/sub connection, as redis requires.
pub struct RedisBroker {
    client: redis::Client,
    connection: redis::aio::MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| redis_err("invalid redis url", e))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| redis_err("redis connect", e))?;
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .publish(channel, payload)
            .await
            .map_err(|e| redis_err("redis publish", e))?;
        Ok(())
    }

    async fn publish_many(&self, channel: &str, payloads: Vec<Vec<u8>>) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        for payload in payloads {
            pipe.cmd("PUBLISH").arg(channel).arg(payload).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| redis_err("redis pipeline publish", e))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| redis_err("redis pubsub connect", e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| redis_err("redis subscribe", e))?;

        let (tx, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let pump_token = token.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = pump_token.cancelled() => {
                        debug!(channel = %channel, "redis subscription cancelled");
                        break;
                    }
                    msg = stream.next() => match msg {
                        Some(msg) => {
                            if tx.send(msg.get_payload_bytes().to_vec()).is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!(channel = %channel, "redis pubsub stream closed");
                            break;
                        }
                    },
                }
            }
        });

        Ok(BrokerSubscription::new(receiver, token))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| redis_err("redis ping", e))?;
        Ok(())
    }
}
