//! Sinks: terminal consumers.
//!
//! - `category`: one sink per routed category, with a message history feed
//! - `monitor`: the wildcard observer of every event in the pipeline
//! - `feed`: SSE and WebSocket plumbing shared by both

pub mod category;
pub mod feed;
pub mod monitor;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatch::Endpoint;
use crate::envelope::Envelope;
use crate::error::DeliveryError;

pub use category::{CategoryMessage, CategorySink, category_routes};
pub use monitor::{DisplayStage, MonitorEvent, MonitorSink, monitor_routes};

/// A terminal consumer. Never replies.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Destination name the sink is registered under.
    fn name(&self) -> &str;

    /// Take one event. Returns `false` if it was already seen.
    async fn accept(&self, envelope: &Envelope) -> bool;
}

/// Serves a `Sink` as an acknowledge-only `Endpoint`.
pub struct SinkEndpoint {
    sink: Arc<dyn Sink>,
}

impl SinkEndpoint {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Endpoint for SinkEndpoint {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, DeliveryError> {
        if !self.sink.accept(&envelope).await {
            debug!(sink = self.sink.name(), event_id = %envelope.id(), "Duplicate delivery ignored");
        }
        Ok(None)
    }
}
