//! Serve an `Endpoint` over HTTP.
//!
//! The inverse of the remote route in `RouteTable`: an envelope POSTed as
//! JSON is decoded and handed to the endpoint, and the result is mapped back
//! to a status code the HTTP transport understands.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use tracing::{debug, warn};

use crate::dispatch::transport::Endpoint;
use crate::envelope;
use crate::error::DeliveryError;

/// Router exposing `POST /` for one endpoint.
pub fn endpoint_routes(endpoint: Arc<dyn Endpoint>) -> Router {
    Router::new()
        .route("/", post(handle_envelope))
        .with_state(endpoint)
}

async fn handle_envelope(State(endpoint): State<Arc<dyn Endpoint>>, body: Bytes) -> Response {
    let envelope = match envelope::decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Rejected malformed envelope");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    let event_id = envelope.id();

    match endpoint.handle(envelope).await {
        Ok(Some(reply)) => match envelope::encode(&reply) {
            Ok(bytes) => {
                debug!(%event_id, reply_id = %reply.id(), "Endpoint replied");
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    bytes,
                )
                    .into_response()
            }
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(%event_id, error = %e, "Endpoint failed");
            error_response(status_for(&e), e.to_string())
        }
    }
}

fn status_for(error: &DeliveryError) -> StatusCode {
    match error {
        DeliveryError::Permanent(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DeliveryError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        DeliveryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DeliveryError::UnknownDestination(_) => StatusCode::NOT_FOUND,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
