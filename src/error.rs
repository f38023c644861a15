//! Error types for the event relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broker and log-store errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The underlying log could not be reached after the bounded retry.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Partition {partition} of topic {topic} unavailable: {reason}")]
    PartitionUnavailable {
        topic: String,
        partition: u32,
        reason: String,
    },

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    /// Whether a caller should retry the operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::PartitionUnavailable { .. })
    }
}

/// Envelope encode/decode errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by a destination endpoint or the transport reaching it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The endpoint rejected the envelope; retrying will not help.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    #[error("No endpoint registered for destination {0}")]
    UnknownDestination(String),
}

impl DeliveryError {
    /// Transient failures count against the retry budget; the rest dead-letter at once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

/// Trigger registration errors.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Invalid trigger pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Stage invocation errors. Business outcomes are events, not errors.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Transient stage failure: {0}")]
    Transient(String),
}

impl From<StageError> for DeliveryError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::MalformedPayload(reason) => DeliveryError::Permanent(reason),
            StageError::Transient(reason) => DeliveryError::Transient(reason),
        }
    }
}

/// Keyed lookup errors. A missing key is `Ok(None)`, not an error.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Lookup service unavailable: {0}")]
    Unavailable(String),
}

impl From<LookupError> for StageError {
    fn from(err: LookupError) -> Self {
        StageError::Transient(err.to_string())
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_map_to_delivery_taxonomy() {
        let permanent: DeliveryError = StageError::MalformedPayload("no content".into()).into();
        assert!(!permanent.is_retryable());

        let transient: DeliveryError = StageError::Transient("db down".into()).into();
        assert!(transient.is_retryable());
    }

    #[test]
    fn lookup_unavailability_is_transient() {
        let stage: StageError = LookupError::Unavailable("refused".into()).into();
        assert!(matches!(stage, StageError::Transient(_)));
    }

    #[test]
    fn timeout_is_retryable() {
        assert!(DeliveryError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!DeliveryError::UnknownDestination("x".into()).is_retryable());
    }
}
