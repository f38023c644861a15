//! Envelope data model: event types, sources, and the envelope itself.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

// ── Event type ──────────────────────────────────────────────────────

/// Hierarchical dotted event type, e.g. `com.learning.message.received`.
///
/// Segments are non-empty and contain no whitespace or `*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    /// Parse and validate a dotted type string.
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        if raw.is_empty() {
            return Err(CodecError::MalformedEnvelope("empty event type".into()));
        }
        for segment in raw.split('.') {
            if segment.is_empty() {
                return Err(CodecError::MalformedEnvelope(format!(
                    "event type {raw:?} has an empty segment"
                )));
            }
            if segment.contains('*') || segment.chars().any(char::is_whitespace) {
                return Err(CodecError::MalformedEnvelope(format!(
                    "event type {raw:?} contains an invalid segment {segment:?}"
                )));
            }
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Append one or more segments (`"routed.finance"`).
    pub fn child(&self, suffix: &str) -> Result<Self, CodecError> {
        Self::parse(&format!("{}.{}", self.0, suffix))
    }

    /// The topic this type is published on: its first `depth` segments.
    ///
    /// Types with `depth` segments or fewer are their own topic.
    pub fn topic(&self, depth: usize) -> String {
        let depth = depth.max(1);
        self.segments().take(depth).collect::<Vec<_>>().join(".")
    }
}

impl TryFrom<String> for EventType {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Identity of a producing stage plus its timestamp clock.
///
/// Timestamps handed out by one `Source` never go backwards, even if the
/// wall clock does.
#[derive(Debug)]
pub struct Source {
    name: String,
    last_micros: AtomicI64,
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_micros: AtomicI64::new(i64::MIN),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next timestamp for this source, `max(wall clock, previous)`.
    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let prev = self.last_micros.fetch_max(wall, Ordering::AcqRel);
        let micros = wall.max(prev);
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// Event envelope: metadata plus an opaque structured payload.
///
/// Fields are private; the only ways to obtain an envelope with different
/// content are [`Envelope::new`] and [`Envelope::derive`], both of which
/// assign a new id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: EventType,
    source: String,
    time: DateTime<Utc>,
    /// Business entity the event is about (the original message id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    payload: serde_json::Value,
    #[serde(default)]
    attempt: u32,
    /// Last delivery error, set only on dead-lettered copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl Envelope {
    /// Create a new envelope stamped by `source`.
    pub fn new(event_type: EventType, source: &Source, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source: source.name().to_string(),
            time: source.now(),
            subject: None,
            payload,
            attempt: 0,
            last_error: None,
        }
    }

    /// Set the correlation subject. Only meaningful before publishing.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Build a follow-on event from this one: new id, new type, same subject.
    pub fn derive(&self, event_type: EventType, source: &Source, payload: serde_json::Value) -> Self {
        let mut next = Self::new(event_type, source, payload);
        next.subject = self.subject.clone();
        next
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Deserialize the payload into a stage-specific schema.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CodecError::MalformedEnvelope(format!("payload schema: {e}")))
    }

    /// Per-attempt copy handed to a transport. The stored envelope is untouched.
    pub(crate) fn delivery_copy(&self, attempt: u32) -> Self {
        let mut copy = self.clone();
        copy.attempt = attempt;
        copy
    }

    /// Copy published to a dead-letter topic after delivery gave up.
    pub(crate) fn dead_letter(&self, attempts: u32, error: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.attempt = attempts;
        copy.last_error = Some(error.into());
        copy
    }
}
