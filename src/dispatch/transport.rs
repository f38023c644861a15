//! Delivery transports: how an envelope reaches a destination.
//!
//! An [`Endpoint`] is anything that handles one envelope and optionally
//! replies with a follow-on envelope. The [`RouteTable`] maps destinations
//! either to an in-process endpoint or to a remote HTTP endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::envelope::{self, Envelope};
use crate::error::DeliveryError;
use crate::triggers::Destination;

/// Request/response handler for delivered envelopes.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Handle one envelope. `Ok(Some(reply))` asks the dispatcher to publish
    /// the reply; `Ok(None)` is a plain acknowledgment.
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, DeliveryError>;
}

/// Delivers an envelope to a named destination.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        destination: &Destination,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DeliveryError>;
}

#[derive(Clone)]
enum Route {
    Local(Arc<dyn Endpoint>),
    Remote(String),
}

/// Destination → endpoint table, fixed after startup.
#[derive(Clone)]
pub struct RouteTable {
    routes: BTreeMap<Destination, Route>,
    client: reqwest::Client,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Deliver to `destination` by calling `endpoint` in-process.
    pub fn register_local(&mut self, destination: impl Into<Destination>, endpoint: Arc<dyn Endpoint>) {
        self.routes.insert(destination.into(), Route::Local(endpoint));
    }

    /// Deliver to `destination` by POSTing to `url`.
    pub fn register_remote(&mut self, destination: impl Into<Destination>, url: impl Into<String>) {
        self.routes.insert(destination.into(), Route::Remote(url.into()));
    }

    pub fn contains(&self, destination: &Destination) -> bool {
        self.routes.contains_key(destination)
    }

    /// In-process endpoints, for mounting over HTTP.
    pub fn local_endpoints(&self) -> Vec<(Destination, Arc<dyn Endpoint>)> {
        self.routes
            .iter()
            .filter_map(|(dest, route)| match route {
                Route::Local(endpoint) => Some((dest.clone(), Arc::clone(endpoint))),
                Route::Remote(_) => None,
            })
            .collect()
    }

    async fn post(&self, url: &str, envelope: &Envelope) -> Result<Option<Envelope>, DeliveryError> {
        let body = envelope::encode(envelope)
            .map_err(|e| DeliveryError::Permanent(format!("encode envelope: {e}")))?;

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("ce-id", envelope.id().to_string())
            .header("ce-type", envelope.event_type().as_str())
            .header("ce-source", envelope.source())
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("POST {url}: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DeliveryError::Transient(format!("read response from {url}: {e}")))?;
        debug!(url, status = status.as_u16(), body_len = bytes.len(), "Remote endpoint responded");

        if status.is_success() {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            return envelope::decode(&bytes)
                .map(Some)
                .map_err(|e| DeliveryError::Permanent(format!("malformed reply from {url}: {e}")));
        }

        let detail = format!("{url} returned {status}: {}", String::from_utf8_lossy(&bytes));
        Err(classify_status(status, detail))
    }
}

/// Map a non-success HTTP status onto the delivery taxonomy.
pub fn classify_status(status: StatusCode, detail: String) -> DeliveryError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        DeliveryError::Transient(detail)
    } else {
        DeliveryError::Permanent(detail)
    }
}

#[async_trait]
impl DeliveryTransport for RouteTable {
    async fn deliver(
        &self,
        destination: &Destination,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DeliveryError> {
        match self.routes.get(destination) {
            Some(Route::Local(endpoint)) => endpoint.handle(envelope.clone()).await,
            Some(Route::Remote(url)) => self.post(url, envelope).await,
            None => Err(DeliveryError::UnknownDestination(destination.to_string())),
        }
    }
}
