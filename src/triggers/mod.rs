//! Trigger registry: which destinations want which event types.
//!
//! A trigger binds an event-type pattern to a destination consumer group.
//! Patterns are:
//! - `exact.type`: matches only that type (case-sensitive)
//! - `prefix.*`: matches `prefix.X` for exactly one further segment
//! - `*`: matches everything (the wildcard observability sink)
//!
//! The registry is built mutably at startup, then shared behind an `Arc` and
//! never changed again. It is a set: registration order never affects
//! [`TriggerRegistry::matches`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::EventType;
use crate::error::TriggerError;

// ── Pattern ─────────────────────────────────────────────────────────

/// A parsed event-type pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypePattern {
    Exact(String),
    /// `prefix.*`: holds `prefix` without the trailing `.*`.
    Children(String),
    Any,
}

impl TypePattern {
    pub fn parse(raw: &str) -> Result<Self, TriggerError> {
        let invalid = |reason: &str| TriggerError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(prefix) = raw.strip_suffix(".*") {
            if prefix.contains('*') {
                return Err(invalid("only a single trailing wildcard segment is allowed"));
            }
            EventType::parse(prefix).map_err(|e| invalid(&e.to_string()))?;
            return Ok(Self::Children(prefix.to_string()));
        }
        if raw.contains('*') {
            return Err(invalid("wildcard must be the whole last segment"));
        }
        EventType::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self::Exact(raw.to_string()))
    }

    /// Whether a dotted name (event type or topic) matches this pattern.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Children(prefix) => name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|segment| !segment.is_empty() && !segment.contains('.')),
            Self::Any => true,
        }
    }

    pub fn is_universal(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl fmt::Display for TypePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Children(prefix) => write!(f, "{prefix}.*"),
            Self::Any => f.write_str("*"),
        }
    }
}

// ── Destination / Trigger ───────────────────────────────────────────

/// Name of a consumer group that receives matched events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(String);

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A (pattern, destination) binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Trigger {
    pub pattern: TypePattern,
    pub destination: Destination,
}

// ── Registry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TriggerRegistry {
    triggers: BTreeSet<Trigger>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trigger. Returns `false` if the exact binding already existed.
    pub fn register(
        &mut self,
        pattern: &str,
        destination: impl Into<Destination>,
    ) -> Result<bool, TriggerError> {
        let trigger = Trigger {
            pattern: TypePattern::parse(pattern)?,
            destination: destination.into(),
        };
        tracing::debug!(
            pattern = %trigger.pattern,
            destination = %trigger.destination,
            "Trigger registered"
        );
        Ok(self.triggers.insert(trigger))
    }

    /// Every destination with at least one trigger matching `event_type`.
    pub fn matches(&self, event_type: &EventType) -> BTreeSet<Destination> {
        self.triggers
            .iter()
            .filter(|t| t.pattern.matches(event_type.as_str()))
            .map(|t| t.destination.clone())
            .collect()
    }

    /// Whether `destination` wants `event_type`.
    pub fn wants(&self, destination: &Destination, event_type: &EventType) -> bool {
        self.triggers
            .iter()
            .any(|t| &t.destination == destination && t.pattern.matches(event_type.as_str()))
    }

    /// Patterns bound to one destination.
    pub fn patterns_for(&self, destination: &Destination) -> Vec<&TypePattern> {
        self.triggers
            .iter()
            .filter(|t| &t.destination == destination)
            .map(|t| &t.pattern)
            .collect()
    }

    pub fn destinations(&self) -> BTreeSet<Destination> {
        self.triggers.iter().map(|t| t.destination.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
