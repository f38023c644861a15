//! Category sink: collects the messages routed to one category.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::info;
use uuid::Uuid;

use super::Sink;
use super::feed::{BROADCAST_CAPACITY, History, sse_feed};
use crate::envelope::Envelope;

const HISTORY_CAPACITY: usize = 100;
const LIST_LIMIT: usize = 50;

/// One message as shown by a category feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMessage {
    pub event_id: Uuid,
    pub event_type: String,
    pub message_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

pub struct CategorySink {
    name: String,
    category: String,
    history: RwLock<History<Uuid, CategoryMessage>>,
    tx: broadcast::Sender<CategoryMessage>,
}

impl CategorySink {
    /// Registered as `<category>-handler`.
    pub fn new(category: impl Into<String>) -> Arc<Self> {
        let category = category.into();
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            name: format!("{category}-handler"),
            category,
            history: RwLock::new(History::new(HISTORY_CAPACITY)),
            tx,
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Most recent messages, oldest first, and the total ever accepted.
    pub async fn recent(&self, limit: usize) -> (Vec<CategoryMessage>, u64) {
        let history = self.history.read().await;
        (history.recent(limit), history.total())
    }

    /// History snapshot and a receiver for everything after it.
    pub async fn subscribe(&self) -> (Vec<CategoryMessage>, broadcast::Receiver<CategoryMessage>) {
        let history = self.history.read().await;
        (history.all(), self.tx.subscribe())
    }
}

#[async_trait]
impl Sink for CategorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn accept(&self, envelope: &Envelope) -> bool {
        let message = CategoryMessage {
            event_id: envelope.id(),
            event_type: envelope.event_type().to_string(),
            message_id: envelope.subject().map(str::to_string),
            received_at: Utc::now(),
            payload: envelope.payload().clone(),
        };

        let mut history = self.history.write().await;
        if !history.push(envelope.id(), message.clone()) {
            return false;
        }
        // No receivers is fine.
        let _ = self.tx.send(message);

        info!(
            category = %self.category,
            event_id = %envelope.id(),
            message_id = envelope.subject().unwrap_or("unknown"),
            listeners = self.tx.receiver_count(),
            "Message delivered to category"
        );
        true
    }
}

/// `GET /messages` and `GET /stream` for one category.
pub fn category_routes(sink: Arc<CategorySink>) -> Router {
    Router::new()
        .route("/messages", get(list_messages))
        .route("/stream", get(stream_messages))
        .with_state(sink)
}

async fn list_messages(State(sink): State<Arc<CategorySink>>) -> impl IntoResponse {
    let (messages, total) = sink.recent(LIST_LIMIT).await;
    Json(serde_json::json!({
        "category": sink.category(),
        "total": total,
        "messages": messages,
    }))
}

async fn stream_messages(State(sink): State<Arc<CategorySink>>) -> impl IntoResponse {
    let (history, rx) = sink.subscribe().await;
    sse_feed(history, rx, "category_message")
}
