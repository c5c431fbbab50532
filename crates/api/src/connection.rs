//! Axum websocket adapter for the hub's connection seam.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::Mutex;

use wayfarer_common::{CoreError, Result};
use wayfarer_realtime::ClientConnection;

/// Write half of an axum websocket, shared behind the hub.
pub struct WebSocketConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WebSocketConnection {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl ClientConnection for WebSocketConnection {
    async fn send_text(&self, text: &str) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.to_string()))
            .await
            .map_err(|e| CoreError::transport(format!("websocket write: {}", e)))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}
