//! JSON wire codec for envelopes.
//!
//! The wire format is the flat object
//! `{id, type, source, time, subject?, payload, attempt, last_error?}`.

use crate::envelope::model::Envelope;
use crate::error::CodecError;

/// Encode an envelope to its wire bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode wire bytes into an envelope.
///
/// Any structural problem is reported as `MalformedEnvelope` so the
/// dispatcher can dead-letter it without invoking a stage. An empty source
/// is an unkeyed envelope, not a structural problem.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
}
