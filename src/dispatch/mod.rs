//! Dispatcher: delivers matched events to destinations.
//!
//! - `retry`: backoff policy and per-delivery retry state machine
//! - `transport`: `Endpoint` / `DeliveryTransport` traits and the `RouteTable`
//! - `http`: serve an `Endpoint` over HTTP
//! - `dispatcher`: timeout, retry, dead-letter
//! - `worker` / `pool`: one ordered worker per (group, topic, partition)

pub mod dispatcher;
pub mod http;
pub mod pool;
pub mod retry;
pub mod transport;
pub mod worker;

pub use dispatcher::{DeliveryOutcome, Dispatcher};
pub use http::endpoint_routes;
pub use pool::WorkerPool;
pub use retry::{RetryPolicy, RetryState, RetryStep};
pub use transport::{DeliveryTransport, Endpoint, RouteTable};
pub use worker::PartitionWorker;
