//! Event Relay: event-driven message pipeline over a partitioned log.

pub mod app;
pub mod broker;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod ingress;
pub mod lookup;
pub mod sinks;
pub mod stages;
pub mod store;
pub mod triggers;
