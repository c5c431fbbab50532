//! Outbound push notifications, executed as pool jobs.
//!
//! The vendor endpoint accepts batches of at most 100 recipients and
//! answers with per-recipient tickets. Tokens the vendor reports as no
//! longer registered are invalidated in the token store.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wayfarer_common::{CoreError, PushSettings, PushToken, Result, UserId};
use wayfarer_storage::PushTokenStore;

use crate::WorkerPool;

const DEVICE_NOT_REGISTERED: &str = "DeviceNotRegistered";

#[derive(Debug, Clone, Serialize)]
struct PushRequest<'a> {
    to: Vec<&'a str>,
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    data: Vec<PushTicket>,
}

#[derive(Debug, Deserialize)]
pub struct PushTicket {
    pub status: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<TicketDetails>,
}

#[derive(Debug, Deserialize)]
pub struct TicketDetails {
    #[serde(default)]
    pub error: Option<String>,
}

impl PushTicket {
    fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    fn device_not_registered(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.error.as_deref())
            .is_some_and(|e| e == DEVICE_NOT_REGISTERED)
    }
}

#[derive(Debug, Clone)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
}

/// HTTP client for the vendor batch endpoint.
pub struct PushClient {
    http: Client,
    endpoint: String,
    batch_size: usize,
}

impl PushClient {
    pub fn new(settings: &PushSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| CoreError::transport(format!("push client init: {}", e)))?;
        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
            batch_size: settings.batch_size.clamp(1, 100),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One batch request; tickets come back in recipient order.
    async fn send_batch(
        &self,
        tokens: &[&str],
        notification: &PushNotification,
    ) -> Result<Vec<PushTicket>> {
        let request = PushRequest {
            to: tokens.to_vec(),
            title: &notification.title,
            body: &notification.body,
            data: notification.data.as_ref(),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::transport(format!("push send: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::transport(format!(
                "push endpoint returned {}",
                response.status()
            )));
        }

        let parsed: PushResponse = response
            .json()
            .await
            .map_err(|e| CoreError::transport(format!("push response decode: {}", e)))?;
        Ok(parsed.data)
    }
}

/// Enqueues push deliveries on the worker pool.
pub struct PushNotifier {
    client: Arc<PushClient>,
    tokens: Arc<dyn PushTokenStore>,
    pool: Arc<WorkerPool>,
}

impl PushNotifier {
    pub fn new(client: Arc<PushClient>, tokens: Arc<dyn PushTokenStore>, pool: Arc<WorkerPool>) -> Self {
        Self { client, tokens, pool }
    }

    /// Submit a delivery job for the given recipients. Returns whether the
    /// pool accepted it; a full queue drops the notification.
    pub async fn enqueue(&self, recipients: Vec<UserId>, notification: PushNotification) -> bool {
        if recipients.is_empty() {
            return true;
        }
        let client = self.client.clone();
        let tokens = self.tokens.clone();

        let accepted = self
            .pool
            .submit(move |cancel| async move {
                deliver(client, tokens, recipients, notification, cancel).await;
            })
            .await;
        if !accepted {
            warn!("push queue full; notification dropped");
        }
        accepted
    }
}

async fn deliver(
    client: Arc<PushClient>,
    store: Arc<dyn PushTokenStore>,
    recipients: Vec<UserId>,
    notification: PushNotification,
    cancel: CancellationToken,
) {
    let tokens: Vec<PushToken> = match store.list_active_tokens(&recipients).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(error = %e, "failed to load push tokens");
            return;
        }
    };
    if tokens.is_empty() {
        debug!("no active push tokens for recipients");
        return;
    }

    for chunk in tokens.chunks(client.batch_size()) {
        if cancel.is_cancelled() {
            debug!("push delivery cancelled mid-batch");
            return;
        }
        let chunk_tokens: Vec<&str> = chunk.iter().map(|t| t.token.as_str()).collect();
        match client.send_batch(&chunk_tokens, &notification).await {
            Ok(tickets) => {
                for (token, ticket) in chunk.iter().zip(tickets.iter()) {
                    if ticket.is_ok() {
                        if let Err(e) = store.mark_token_used(&token.token).await {
                            warn!(error = %e, "failed to mark push token used");
                        }
                    } else if ticket.device_not_registered() {
                        info!(user_id = %token.user_id, "invalidating unregistered push token");
                        if let Err(e) = store.invalidate_token(&token.token).await {
                            warn!(error = %e, "failed to invalidate push token");
                        }
                    } else {
                        warn!(
                            status = %ticket.status,
                            message = ?ticket.message,
                            "push ticket reported failure"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "push batch failed"),
        }
    }
}
