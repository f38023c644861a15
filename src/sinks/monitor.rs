//! Event monitor: the wildcard sink that observes every event.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Sink;
use super::feed::{BROADCAST_CAPACITY, History, sse_feed};
use crate::envelope::Envelope;

pub const MONITOR_NAME: &str = "event-monitor";

const HISTORY_CAPACITY: usize = 200;

/// A dead-lettered copy keeps the event id but carries `last_error`, so it is
/// recorded separately from the event it copies.
type SeenKey = (Uuid, Option<String>);

/// Where in the pipeline an observed event sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStage {
    Received,
    Extracted,
    Validated,
    Enriched,
    Routed,
    Failed,
    Unknown,
}

impl DisplayStage {
    /// Dead-lettered copies carry `last_error` and are always `Failed`;
    /// otherwise the first matching word in the type decides.
    pub fn for_envelope(envelope: &Envelope) -> Self {
        if envelope.last_error().is_some() {
            return Self::Failed;
        }
        let ty = envelope.event_type().as_str();
        if ty.contains("received") {
            Self::Received
        } else if ty.contains("extracted") {
            Self::Extracted
        } else if ty.contains("validated") || ty.contains("validation") {
            Self::Validated
        } else if ty.contains("enriched") {
            Self::Enriched
        } else if ty.contains("routed") {
            Self::Routed
        } else if ty.contains("failed") || ty.contains("error") || ty.contains("malformed") {
            Self::Failed
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub message_id: String,
    pub stage: DisplayStage,
    pub observed_at: DateTime<Utc>,
    pub event: Envelope,
}

/// Frames sent to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MonitorFrame {
    Sync { events: Vec<MonitorEvent> },
    Event { event: MonitorEvent },
}

pub struct MonitorSink {
    history: RwLock<History<SeenKey, MonitorEvent>>,
    tx: broadcast::Sender<MonitorEvent>,
}

impl MonitorSink {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            history: RwLock::new(History::new(HISTORY_CAPACITY)),
            tx,
        })
    }

    pub async fn events(&self) -> Vec<MonitorEvent> {
        self.history.read().await.all()
    }

    /// History snapshot and a receiver for everything after it.
    pub async fn subscribe(&self) -> (Vec<MonitorEvent>, broadcast::Receiver<MonitorEvent>) {
        let history = self.history.read().await;
        (history.all(), self.tx.subscribe())
    }
}

#[async_trait]
impl Sink for MonitorSink {
    fn name(&self) -> &str {
        MONITOR_NAME
    }

    async fn accept(&self, envelope: &Envelope) -> bool {
        let event = MonitorEvent {
            message_id: envelope.subject().unwrap_or("unknown").to_string(),
            stage: DisplayStage::for_envelope(envelope),
            observed_at: Utc::now(),
            event: envelope.clone(),
        };

        let mut history = self.history.write().await;
        let key = (envelope.id(), envelope.last_error().map(str::to_string));
        if !history.push(key, event.clone()) {
            return false;
        }
        let _ = self.tx.send(event.clone());

        info!(
            message_id = %event.message_id,
            event_type = %envelope.event_type(),
            stage = ?event.stage,
            "Event captured"
        );
        true
    }
}

/// `GET /events`, `GET /stream` (SSE) and `GET /ws` (WebSocket).
pub fn monitor_routes(monitor: Arc<MonitorSink>) -> Router {
    Router::new()
        .route("/events", get(list_events))
        .route("/stream", get(stream_events))
        .route("/ws", get(ws_handler))
        .with_state(monitor)
}

async fn list_events(State(monitor): State<Arc<MonitorSink>>) -> impl IntoResponse {
    Json(monitor.events().await)
}

async fn stream_events(State(monitor): State<Arc<MonitorSink>>) -> impl IntoResponse {
    let (history, rx) = monitor.subscribe().await;
    sse_feed(history, rx, "monitor_event")
}

async fn ws_handler(ws: WebSocketUpgrade, State(monitor): State<Arc<MonitorSink>>) -> impl IntoResponse {
    info!("Monitor WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, monitor))
}

async fn send_frame(socket: &mut WebSocket, frame: &MonitorFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode monitor frame");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, monitor: Arc<MonitorSink>) {
    let (events, mut rx) = monitor.subscribe().await;
    if !send_frame(&mut socket, &MonitorFrame::Sync { events }).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_frame(&mut socket, &MonitorFrame::Event { event }).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Monitor client lagged behind broadcast");
                        let events = monitor.events().await;
                        if !send_frame(&mut socket, &MonitorFrame::Sync { events }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Monitor WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    debug!("Monitor WebSocket connection closed");
}
