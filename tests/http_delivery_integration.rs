//! Integration tests for delivery over HTTP: retries, dead-lettering and
//! request/reply against endpoints served with `endpoint_routes`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::time::timeout;

use event_relay::broker::{Broker, BrokerConfig, MemoryLog};
use event_relay::dispatch::{Dispatcher, Endpoint, RetryPolicy, RouteTable, WorkerPool, endpoint_routes};
use event_relay::envelope::{Envelope, EventType, Source};
use event_relay::error::DeliveryError;
use event_relay::stages::{DataExtractor, MessagePayload, StageEndpoint};
use event_relay::triggers::{TriggerRegistry, TypePattern};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Always fails with the configured error and counts calls.
struct Failing {
    calls: AtomicU32,
    error: DeliveryError,
}

#[async_trait]
impl Endpoint for Failing {
    async fn handle(&self, _envelope: Envelope) -> Result<Option<Envelope>, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Serve `endpoint` on a random port; returns its URL.
async fn serve(endpoint: Arc<dyn Endpoint>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = endpoint_routes(endpoint);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

async fn relay(destination: &str, pattern: &str, url: String) -> (Arc<Broker>, Arc<WorkerPool>) {
    let broker = Broker::open(
        Arc::new(MemoryLog::new()),
        BrokerConfig {
            idle_poll: Duration::from_millis(20),
            ..BrokerConfig::default()
        },
    )
    .await
    .unwrap();

    let mut routes = RouteTable::new();
    routes.register_remote(destination, url);
    let mut registry = TriggerRegistry::new();
    registry.register(pattern, destination).unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&broker),
        Arc::new(routes),
        RetryPolicy::default().with_base_delay(Duration::from_millis(10)),
        Duration::from_secs(2),
    ));
    let pool = WorkerPool::new(Arc::new(registry), dispatcher);
    pool.start().await;
    (broker, pool)
}

fn received(content: &str) -> Envelope {
    let payload = MessagePayload::received("m-42", content, Utc::now());
    Envelope::new(
        EventType::parse("com.learning.message.received").unwrap(),
        &Source::new("/services/event-producer"),
        serde_json::to_value(&payload).unwrap(),
    )
    .with_subject("m-42")
}

/// Wait for the first record on the dead-letter topic.
async fn next_dead_letter(broker: &Arc<Broker>) -> Envelope {
    let pattern = TypePattern::parse("com.learning.message.dead-letter").unwrap();
    let mut sub = broker.subscribe("audit", pattern).await;
    timeout(TEST_TIMEOUT, sub.next())
        .await
        .expect("nothing was dead-lettered")
        .expect("broker closed")
        .envelope
        .unwrap()
}

#[tokio::test]
async fn permanent_http_failure_dead_letters_after_one_attempt() {
    let endpoint = Arc::new(Failing {
        calls: AtomicU32::new(0),
        error: DeliveryError::Permanent("schema mismatch".into()),
    });
    let url = serve(endpoint.clone()).await;
    let (broker, pool) = relay("billing", "com.learning.message.received", url).await;

    let event = received("anything");
    broker.publish_event(&event).await.unwrap();

    let dead = next_dead_letter(&broker).await;
    assert_eq!(dead.id(), event.id());
    assert_eq!(dead.attempt(), 1);
    assert!(dead.last_error().unwrap().starts_with("billing:"));
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

    timeout(TEST_TIMEOUT, pool.shutdown()).await.unwrap();
}

#[tokio::test]
async fn transient_http_failure_retries_until_budget_then_dead_letters() {
    let endpoint = Arc::new(Failing {
        calls: AtomicU32::new(0),
        error: DeliveryError::Transient("database down".into()),
    });
    let url = serve(endpoint.clone()).await;
    let (broker, pool) = relay("billing", "com.learning.message.received", url).await;

    let event = received("anything");
    broker.publish_event(&event).await.unwrap();

    let dead = next_dead_letter(&broker).await;
    assert_eq!(dead.id(), event.id());
    assert_eq!(dead.attempt(), 3);
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);

    timeout(TEST_TIMEOUT, pool.shutdown()).await.unwrap();
}

#[tokio::test]
async fn remote_stage_reply_is_published() {
    let base = EventType::parse("com.learning.message").unwrap();
    let url = serve(Arc::new(StageEndpoint::new(Arc::new(DataExtractor::new()), base))).await;
    let (broker, pool) = relay("data-extractor", "com.learning.message.received", url).await;

    let mut sub = broker
        .subscribe("observer", TypePattern::parse("com.learning.message").unwrap())
        .await;
    let event = received("Please call me, my email is jane@example.com");
    broker.publish_event(&event).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, async {
        loop {
            let delivery = sub.next().await.expect("broker closed");
            let envelope = delivery.envelope.unwrap();
            if envelope.event_type().as_str() == "com.learning.message.extracted" {
                return envelope;
            }
        }
    })
    .await
    .expect("no extracted event");

    assert_eq!(reply.subject(), Some("m-42"));
    assert_eq!(reply.source(), "/services/data-extractor");
    let payload: MessagePayload = reply.payload_as().unwrap();
    assert_eq!(payload.email(), Some("jane@example.com"));

    timeout(TEST_TIMEOUT, pool.shutdown()).await.unwrap();
}
