//! Dispatcher: deliver with timeout and retry, dead-letter on give-up.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::dispatch::retry::{RetryPolicy, RetryStep};
use crate::dispatch::transport::DeliveryTransport;
use crate::envelope::{Envelope, EventType, Source};
use crate::error::DeliveryError;
use crate::triggers::{Destination, TriggerRegistry};

/// Source name stamped on envelopes the dispatcher creates itself.
pub const DISPATCHER_SOURCE: &str = "/relay/dispatcher";

/// Result of delivering one event to one destination.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered {
        attempts: u32,
        reply: Option<Envelope>,
    },
    /// Gave up; a dead-letter copy was published (best-effort).
    DeadLettered { attempts: u32, error: DeliveryError },
    /// Gave up on an event that was already dead-lettered; logged and dropped.
    Dropped { attempts: u32, error: DeliveryError },
}

pub struct Dispatcher {
    broker: Arc<Broker>,
    transport: Arc<dyn DeliveryTransport>,
    policy: RetryPolicy,
    timeout: Duration,
    source: Source,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<Broker>,
        transport: Arc<dyn DeliveryTransport>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            broker,
            transport,
            policy,
            timeout,
            source: Source::new(DISPATCHER_SOURCE),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Deliver `envelope`, read from `topic`, to `destination`.
    ///
    /// Attempt `n` (1-based) carries `attempt = n - 1` on its delivery copy;
    /// the stored envelope is never touched. Timeouts and transient errors
    /// are retried with backoff until the budget is spent, anything else
    /// gives up at once.
    pub async fn deliver(&self, destination: &Destination, topic: &str, envelope: &Envelope) -> DeliveryOutcome {
        let mut state = self.policy.start();

        loop {
            let copy = envelope.delivery_copy(state.attempts());
            let result = match tokio::time::timeout(self.timeout, self.transport.deliver(destination, &copy)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(self.timeout)),
            };

            let error = match result {
                Ok(reply) => {
                    let attempts = state.attempts() + 1;
                    debug!(
                        event_id = %envelope.id(),
                        event_type = %envelope.event_type(),
                        %destination,
                        attempts,
                        replied = reply.is_some(),
                        "Delivered"
                    );
                    return DeliveryOutcome::Delivered { attempts, reply };
                }
                Err(e) => e,
            };

            match state.record_failure(&error) {
                RetryStep::Retry { delay } => {
                    warn!(
                        event_id = %envelope.id(),
                        %destination,
                        attempt = state.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryStep::GiveUp { attempts } => {
                    return self.give_up(destination, topic, envelope, attempts, error).await;
                }
            }
        }
    }

    /// Deliver one event to every destination it matches, concurrently.
    pub async fn fan_out(
        &self,
        registry: &TriggerRegistry,
        topic: &str,
        envelope: &Envelope,
    ) -> Vec<(Destination, DeliveryOutcome)> {
        let destinations: BTreeSet<Destination> = registry.matches(envelope.event_type());
        let deliveries = destinations.into_iter().map(|destination| async move {
            let outcome = self.deliver(&destination, topic, envelope).await;
            (destination, outcome)
        });
        join_all(deliveries).await
    }

    async fn give_up(
        &self,
        destination: &Destination,
        topic: &str,
        envelope: &Envelope,
        attempts: u32,
        error: DeliveryError,
    ) -> DeliveryOutcome {
        if Broker::is_dead_letter_topic(topic) {
            error!(
                event_id = %envelope.id(),
                %destination,
                topic,
                attempts,
                error = %error,
                "Delivery of dead-lettered event failed, dropping"
            );
            return DeliveryOutcome::Dropped { attempts, error };
        }

        let dead = envelope.dead_letter(attempts, format!("{destination}: {error}"));
        let dlt = Broker::dead_letter_topic(topic);
        match self.broker.publish(&dlt, &dead).await {
            Ok(receipt) => info!(
                event_id = %envelope.id(),
                %destination,
                topic = %dlt,
                offset = receipt.offset,
                attempts,
                error = %error,
                "Event dead-lettered"
            ),
            Err(e) => error!(
                event_id = %envelope.id(),
                %destination,
                topic = %dlt,
                error = %e,
                "Dead-letter publish failed"
            ),
        }
        DeliveryOutcome::DeadLettered { attempts, error }
    }

    /// Dead-letter a record that could not be decoded. The raw text and the
    /// decode error travel in a new `<topic>.malformed` envelope.
    pub async fn dead_letter_malformed(&self, delivery: &Delivery) {
        let reason = match &delivery.envelope {
            Err(e) => e.to_string(),
            Ok(_) => return,
        };
        if Broker::is_dead_letter_topic(&delivery.topic) {
            error!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %reason,
                "Malformed record on dead-letter topic, dropping"
            );
            return;
        }

        let event_type = match EventType::parse(&format!("{}.malformed", delivery.topic)) {
            Ok(t) => t,
            Err(e) => {
                error!(topic = %delivery.topic, error = %e, "Cannot name malformed-record type");
                return;
            }
        };
        let payload = serde_json::json!({
            "raw": String::from_utf8_lossy(&delivery.bytes),
            "error": reason,
            "topic": delivery.topic,
            "partition": delivery.partition,
            "offset": delivery.offset,
        });
        let dead = Envelope::new(event_type, &self.source, payload).dead_letter(0, reason.clone());

        let dlt = Broker::dead_letter_topic(&delivery.topic);
        match self.broker.publish(&dlt, &dead).await {
            Ok(_) => warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %reason,
                "Malformed record dead-lettered"
            ),
            Err(e) => error!(
                topic = %delivery.topic,
                offset = delivery.offset,
                error = %e,
                "Dead-letter publish of malformed record failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::broker::{BrokerConfig, MemoryLog};
    use crate::dispatch::transport::{Endpoint, RouteTable};
    use crate::triggers::TypePattern;

    /// Endpoint that fails with a fixed error for its first `failures` calls.
    struct Flaky {
        calls: AtomicU32,
        seen_attempts: std::sync::Mutex<Vec<u32>>,
        failures: u32,
        error: DeliveryError,
    }

    impl Flaky {
        fn new(failures: u32, error: DeliveryError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                seen_attempts: std::sync::Mutex::new(Vec::new()),
                failures,
                error,
            })
        }
    }

    #[async_trait]
    impl Endpoint for Flaky {
        async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, DeliveryError> {
            self.seen_attempts.lock().unwrap().push(envelope.attempt());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(None)
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Endpoint for Slow {
        async fn handle(&self, _envelope: Envelope) -> Result<Option<Envelope>, DeliveryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    async fn setup(endpoint: Arc<dyn Endpoint>) -> (Arc<Broker>, Dispatcher) {
        let broker = Broker::open(Arc::new(MemoryLog::new()), BrokerConfig::default())
            .await
            .unwrap();
        let mut routes = RouteTable::new();
        routes.register_local("dest", endpoint);
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(100));
        let dispatcher = Dispatcher::new(broker.clone(), Arc::new(routes), policy, Duration::from_secs(1));
        (broker, dispatcher)
    }

    fn sample() -> Envelope {
        Envelope::new(
            EventType::parse("com.learning.message.received").unwrap(),
            &Source::new("/services/producer"),
            serde_json::json!({"content": "hi"}),
        )
    }

    async fn dead_letters(broker: &Arc<Broker>) -> Vec<Envelope> {
        let topic = "com.learning.message.dead-letter";
        let Some(info) = broker.topics().await.into_iter().find(|t| t.name == topic) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for p in 0..info.partitions {
            for record in broker.log().read(topic, p, 0, 100).await.unwrap() {
                out.push(crate::envelope::decode(&record.bytes).unwrap());
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_dead_letters_after_one_attempt() {
        let endpoint = Flaky::new(u32::MAX, DeliveryError::Permanent("malformed payload".into()));
        let (broker, dispatcher) = setup(endpoint.clone()).await;
        let envelope = sample();

        let outcome = dispatcher
            .deliver(&Destination::new("dest"), "com.learning.message", &envelope)
            .await;
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 1, .. }));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

        let dead = dead_letters(&broker).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id(), envelope.id());
        assert_eq!(dead[0].attempt(), 1);
        assert!(dead[0].last_error().unwrap().contains("malformed payload"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_yields_exactly_one_dead_letter_with_max_attempt() {
        let endpoint = Flaky::new(u32::MAX, DeliveryError::Transient("503".into()));
        let (broker, dispatcher) = setup(endpoint.clone()).await;
        let envelope = sample();

        let outcome = dispatcher
            .deliver(&Destination::new("dest"), "com.learning.message", &envelope)
            .await;
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 3, .. }));
        assert_eq!(*endpoint.seen_attempts.lock().unwrap(), vec![0, 1, 2]);

        let dead = dead_letters(&broker).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt(), dispatcher.policy().max_attempts);
        assert_eq!(envelope.attempt(), 0, "stored envelope untouched");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_is_delivered() {
        let endpoint = Flaky::new(2, DeliveryError::Transient("busy".into()));
        let (broker, dispatcher) = setup(endpoint.clone()).await;

        let started = tokio::time::Instant::now();
        let outcome = dispatcher
            .deliver(&Destination::new("dest"), "com.learning.message", &sample())
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3, reply: None });
        // 100ms + 200ms of backoff on the paused clock.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert!(dead_letters(&broker).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_against_budget() {
        let (broker, dispatcher) = setup(Arc::new(Slow)).await;
        let outcome = dispatcher
            .deliver(&Destination::new("dest"), "com.learning.message", &sample())
            .await;
        match outcome {
            DeliveryOutcome::DeadLettered { attempts, error } => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, DeliveryError::Timeout(_)));
            }
            other => panic!("expected dead-letter, got {other:?}"),
        }
        assert_eq!(dead_letters(&broker).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_topic_failures_are_dropped() {
        let endpoint = Flaky::new(u32::MAX, DeliveryError::Permanent("nope".into()));
        let (broker, dispatcher) = setup(endpoint).await;
        let outcome = dispatcher
            .deliver(&Destination::new("dest"), "com.learning.message.dead-letter", &sample())
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Dropped { attempts: 1, .. }));
        assert!(dead_letters(&broker).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_is_dead_lettered_without_delivery() {
        let endpoint = Flaky::new(0, DeliveryError::Permanent("unused".into()));
        let (broker, dispatcher) = setup(endpoint.clone()).await;
        broker.publish_raw("com.learning.message", 0, b"{broken").await.unwrap();

        let mut sub = broker.subscribe_partition("dest", "com.learning.message", 0);
        let delivery = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        dispatcher.dead_letter_malformed(&delivery).await;

        let dead = dead_letters(&broker).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_type().as_str(), "com.learning.message.malformed");
        assert_eq!(dead[0].payload()["raw"], "{broken");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fan_out_reaches_every_matching_destination() {
        let a = Flaky::new(0, DeliveryError::Transient("unused".into()));
        let b = Flaky::new(0, DeliveryError::Transient("unused".into()));
        let broker = Broker::open(Arc::new(MemoryLog::new()), BrokerConfig::default())
            .await
            .unwrap();
        let mut routes = RouteTable::new();
        routes.register_local("a", a.clone());
        routes.register_local("monitor", b.clone());
        let dispatcher = Dispatcher::new(broker, Arc::new(routes), RetryPolicy::default(), Duration::from_secs(1));

        let mut registry = TriggerRegistry::new();
        registry.register("com.learning.message.received", "a").unwrap();
        registry.register("*", "monitor").unwrap();
        assert!(TypePattern::parse("*").unwrap().is_universal());

        let results = dispatcher.fan_out(&registry, "com.learning.message", &sample()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, o)| matches!(o, DeliveryOutcome::Delivered { .. })));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }
}
