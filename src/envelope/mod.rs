//! Event envelope: the unit of transport between stages.
//!
//! An envelope is immutable once published. Stages that want to "modify" an
//! event derive a new envelope with a fresh id and a new type.

pub mod codec;
pub mod model;

pub use codec::{decode, encode};
pub use model::{Envelope, EventType, Source};
