//! Pipeline stages: extractor, validator, enricher, router.
//!
//! A stage is a pure function of (payload, read-only context) to an outcome
//! plus an updated payload. Business failures (no email, spam, unknown
//! customer) are outcomes, i.e. distinct follow-on event types, never errors.
//! `StageEndpoint` adapts a stage to the dispatcher's `Endpoint` seam.

pub mod enricher;
pub mod extractor;
pub mod payload;
pub mod router;
pub mod validator;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::dispatch::Endpoint;
use crate::envelope::{Envelope, EventType, Source};
use crate::error::{DeliveryError, StageError, TriggerError};
use crate::triggers::TriggerRegistry;

pub use enricher::DatabaseEnricher;
pub use extractor::DataExtractor;
pub use payload::{CustomerData, ExtractedData, MessagePayload, Sentiment, ValidationReport};
pub use router::MessageRouter;
pub use validator::ContentValidator;

/// The stages, keyed by what they consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Extractor,
    Validator,
    Enricher,
    Router,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [Self::Extractor, Self::Validator, Self::Enricher, Self::Router];

    /// Destination / consumer-group name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Extractor => "data-extractor",
            Self::Validator => "content-validator",
            Self::Enricher => "database-enricher",
            Self::Router => "message-router",
        }
    }

    /// Source stamped on the stage's replies.
    pub fn source(self) -> String {
        format!("/services/{}", self.name())
    }

    /// Type suffixes (after `<domain>.message.`) this stage consumes.
    pub fn consumes(self) -> &'static [&'static str] {
        match self {
            Self::Extractor => &["received"],
            Self::Validator => &["extracted"],
            Self::Enricher => &["validated"],
            Self::Router => &["enriched", "unknown-customer"],
        }
    }

    /// Which stage consumes `event_type`, if any.
    pub fn for_type(base: &EventType, event_type: &EventType) -> Option<StageKind> {
        let suffix = event_type
            .as_str()
            .strip_prefix(base.as_str())?
            .strip_prefix('.')?;
        Self::ALL
            .into_iter()
            .find(|kind| kind.consumes().contains(&suffix))
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Suffix of the follow-on type, e.g. `extracted` or `routed.finance`.
    pub outcome: String,
    pub payload: MessagePayload,
}

impl StageOutput {
    pub fn new(outcome: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            outcome: outcome.into(),
            payload,
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn process(&self, payload: MessagePayload) -> Result<StageOutput, StageError>;
}

/// Register every stage's consumed types as triggers for its group.
pub fn register_stage_triggers(registry: &mut TriggerRegistry, base: &EventType) -> Result<(), TriggerError> {
    for kind in StageKind::ALL {
        for suffix in kind.consumes() {
            registry.register(&format!("{base}.{suffix}"), kind.name())?;
        }
    }
    Ok(())
}

/// Serves a `Stage` as a request/reply `Endpoint`.
pub struct StageEndpoint {
    stage: Arc<dyn Stage>,
    base: EventType,
    source: Source,
}

impl StageEndpoint {
    /// `base` is the message type prefix, e.g. `com.learning.message`.
    pub fn new(stage: Arc<dyn Stage>, base: EventType) -> Self {
        let source = Source::new(stage.kind().source());
        Self { stage, base, source }
    }
}

#[async_trait]
impl Endpoint for StageEndpoint {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, DeliveryError> {
        let kind = self.stage.kind();
        if StageKind::for_type(&self.base, envelope.event_type()) != Some(kind) {
            return Err(DeliveryError::Permanent(format!(
                "{} does not consume {}",
                kind.name(),
                envelope.event_type()
            )));
        }

        let payload: MessagePayload = envelope
            .payload_as()
            .map_err(|e| StageError::MalformedPayload(e.to_string()))?;
        let message_id = payload.message_id.clone();
        debug!(
            event_id = %envelope.id(),
            message_id = %message_id,
            stage = kind.name(),
            attempt = envelope.attempt(),
            "Stage received event"
        );

        let output = self.stage.process(payload).await.inspect_err(|e| {
            warn!(message_id = %message_id, stage = kind.name(), error = %e, "Stage failed");
        })?;

        let event_type = self
            .base
            .child(&output.outcome)
            .map_err(|e| StageError::MalformedPayload(format!("invalid outcome type: {e}")))?;
        let body = serde_json::to_value(&output.payload)
            .map_err(|e| StageError::MalformedPayload(format!("serialize payload: {e}")))?;

        let mut reply = envelope.derive(event_type, &self.source, body);
        if reply.subject().is_none() {
            reply = reply.with_subject(message_id.clone());
        }

        info!(
            message_id = %message_id,
            stage = kind.name(),
            event_type = %reply.event_type(),
            "Replying"
        );
        Ok(Some(reply))
    }
}
