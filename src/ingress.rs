//! HTTP intake: turns a posted message into a `received` event.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::envelope::{Envelope, EventType, Source};
use crate::error::CodecError;
use crate::stages::MessagePayload;

pub const PRODUCER_SOURCE: &str = "/services/event-producer";

#[derive(Clone)]
struct IngressState {
    broker: Arc<Broker>,
    event_type: EventType,
    source: Arc<Source>,
}

/// `POST /` and `GET /healthz`. `base` is the message type prefix, e.g.
/// `com.learning.message`.
pub fn ingress_routes(broker: Arc<Broker>, base: &EventType) -> Result<Router, CodecError> {
    let state = IngressState {
        broker,
        event_type: base.child("received")?,
        source: Arc::new(Source::new(PRODUCER_SOURCE)),
    };
    Ok(Router::new()
        .route("/", post(produce))
        .route("/healthz", get(healthz))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "OK"
}

fn rejection(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| {
            let mime = mime.trim();
            mime == "application/json" || mime.ends_with("+json")
        })
}

async fn produce(State(state): State<IngressState>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json(&headers) {
        warn!("Request rejected: not JSON");
        return rejection(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Content-Type must be application/json");
    }

    let data: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Request rejected: invalid JSON");
            return rejection(StatusCode::BAD_REQUEST, "Request body must be valid JSON");
        }
    };

    let Some(content) = data.get("content") else {
        warn!("Request rejected: missing 'content' field");
        return rejection(StatusCode::BAD_REQUEST, "Payload must include 'content' field");
    };
    let content = match content.as_str() {
        Some(s) if !s.trim().is_empty() => s,
        _ => {
            warn!("Request rejected: content must be non-empty string");
            return rejection(StatusCode::BAD_REQUEST, "'content' must be a non-empty string");
        }
    };

    let message_id = Uuid::new_v4().to_string();
    let mut payload = MessagePayload::received(message_id.clone(), content, state.source.now());
    payload
        .metadata
        .insert("source_ip".into(), serde_json::Value::from("demo"));
    payload
        .metadata
        .insert("user_agent".into(), serde_json::Value::from("learning-demo"));

    let body = match serde_json::to_value(&payload) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to encode payload");
            return rejection(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode payload");
        }
    };
    let envelope = Envelope::new(state.event_type.clone(), &state.source, body).with_subject(message_id.clone());

    match state.broker.publish_event(&envelope).await {
        Ok(receipt) => {
            info!(
                event_id = %envelope.id(),
                message_id = %message_id,
                topic = %receipt.topic,
                partition = receipt.partition,
                offset = receipt.offset,
                "Event published"
            );
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "status": "success",
                    "message": "Event published to broker",
                    "event_id": envelope.id(),
                    "message_id": message_id,
                    "event_type": envelope.event_type(),
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(event_id = %envelope.id(), error = %e, "Failed to publish event");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "error",
                    "message": "Failed to publish event to broker",
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{BrokerConfig, MemoryLog};

    async fn serve() -> (Arc<Broker>, String) {
        let broker = Broker::open(Arc::new(MemoryLog::new()), BrokerConfig::default())
            .await
            .unwrap();
        let base = EventType::parse("com.learning.message").unwrap();
        let app = ingress_routes(broker.clone(), &base).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (broker, format!("http://{addr}"))
    }

    #[test]
    fn json_content_types() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));
        headers.insert(header::CONTENT_TYPE, "application/json; charset=utf-8".parse().unwrap());
        assert!(is_json(&headers));
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert!(!is_json(&headers));
    }

    #[tokio::test]
    async fn accepted_message_is_published() {
        let (broker, url) = serve().await;
        let client = reqwest::Client::new();

        let resp = tokio::time::timeout(
            Duration::from_secs(5),
            client
                .post(&url)
                .json(&serde_json::json!({"content": "I need help with billing. a@b.com"}))
                .send(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED.as_u16());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["event_type"], "com.learning.message.received");

        let mut sub = broker
            .subscribe("test", crate::triggers::TypePattern::Any)
            .await;
        let delivery = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        let envelope = delivery.envelope.unwrap();
        assert_eq!(envelope.id().to_string(), body["event_id"].as_str().unwrap());
        assert_eq!(envelope.subject(), body["message_id"].as_str());
        let payload: MessagePayload = envelope.payload_as().unwrap();
        assert_eq!(payload.processing_stage, "received");
        assert_eq!(payload.metadata["source_ip"], "demo");
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let (_broker, url) = serve().await;
        let client = reqwest::Client::new();

        let not_json = client.post(&url).body("content=hi").send().await.unwrap();
        assert_eq!(not_json.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE.as_u16());

        for body in [
            serde_json::json!({}),
            serde_json::json!({"content": "   "}),
            serde_json::json!({"content": 42}),
        ] {
            let resp = client.post(&url).json(&body).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST.as_u16());
        }

        let health = client.get(format!("{url}/healthz")).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn closed_broker_is_unavailable() {
        let (broker, url) = serve().await;
        broker.close();
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({"content": "hello there"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE.as_u16());
    }
}
