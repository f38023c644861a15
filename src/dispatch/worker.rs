//! Partition worker: one per (consumer group, topic, partition).
//!
//! Reads its partition strictly in order, so no two deliveries from the same
//! partition to the same group are ever in flight together.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, Subscription};
use crate::dispatch::dispatcher::{DeliveryOutcome, Dispatcher};
use crate::dispatch::pool::topic_may_carry;
use crate::envelope::Envelope;
use crate::error::BrokerError;
use crate::triggers::{Destination, TriggerRegistry};

/// What the worker did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Done; the offset may be committed.
    Commit,
    /// The reply could not be published; re-read from the committed offset.
    Rewind,
}

pub struct PartitionWorker {
    group: Destination,
    topic: String,
    partition: u32,
    registry: Arc<TriggerRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl PartitionWorker {
    pub fn new(
        group: Destination,
        topic: impl Into<String>,
        partition: u32,
        registry: Arc<TriggerRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            group,
            topic: topic.into(),
            partition,
            registry,
            dispatcher,
        }
    }

    /// Consume until the broker closes.
    pub async fn run(self) {
        let broker = Arc::clone(self.dispatcher.broker());
        let mut subscription = broker.subscribe_partition(self.group.as_str(), &self.topic, self.partition);
        info!(
            group = %self.group,
            topic = %self.topic,
            partition = self.partition,
            "Partition worker started"
        );

        while let Some(delivery) = subscription.next().await {
            match self.handle(&delivery).await {
                Handled::Commit => self.commit(&subscription, &delivery).await,
                Handled::Rewind => {
                    subscription.rewind(&self.topic, self.partition);
                    tokio::time::sleep(self.dispatcher.policy().max_delay).await;
                }
            }
        }

        info!(
            group = %self.group,
            topic = %self.topic,
            partition = self.partition,
            "Partition worker stopped"
        );
    }

    /// Process one record: skip, deliver, or dead-letter it.
    pub async fn handle(&self, delivery: &Delivery) -> Handled {
        let envelope = match &delivery.envelope {
            Ok(envelope) => envelope,
            Err(_) => {
                // Every group sees the bad record; only the first dead-letters it.
                if self.is_first_group() {
                    self.dispatcher.dead_letter_malformed(delivery).await;
                }
                return Handled::Commit;
            }
        };

        if !self.registry.wants(&self.group, envelope.event_type()) {
            return Handled::Commit;
        }

        debug!(
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            group = %self.group,
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "Dispatching"
        );

        match self.dispatcher.deliver(&self.group, &delivery.topic, envelope).await {
            DeliveryOutcome::Delivered {
                reply: Some(reply), ..
            } => match self.publish_reply(&reply).await {
                Ok(()) => Handled::Commit,
                Err(e) => {
                    error!(
                        event_id = %envelope.id(),
                        reply_id = %reply.id(),
                        group = %self.group,
                        error = %e,
                        "Reply publish failed, will redeliver"
                    );
                    Handled::Rewind
                }
            },
            DeliveryOutcome::Delivered { reply: None, .. }
            | DeliveryOutcome::DeadLettered { .. }
            | DeliveryOutcome::Dropped { .. } => Handled::Commit,
        }
    }

    /// Publish a reply, retrying transient broker failures with backoff.
    async fn publish_reply(&self, reply: &Envelope) -> Result<(), BrokerError> {
        let policy = self.dispatcher.policy();
        let broker = self.dispatcher.broker();
        let mut retry = 0;

        loop {
            match broker.publish_event(reply).await {
                Ok(receipt) => {
                    debug!(
                        event_id = %reply.id(),
                        event_type = %reply.event_type(),
                        topic = %receipt.topic,
                        partition = receipt.partition,
                        offset = receipt.offset,
                        "Reply published"
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() && retry + 1 < policy.max_attempts => {
                    retry += 1;
                    let delay = policy.delay_for(retry);
                    warn!(event_id = %reply.id(), retry, error = %e, "Reply publish failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn commit(&self, subscription: &Subscription, delivery: &Delivery) {
        if let Err(e) = subscription.commit(delivery).await {
            warn!(
                group = %self.group,
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "Offset commit failed"
            );
        }
    }

    /// Whether this group is the lowest-named one with workers on this
    /// topic; it owns malformed-record dead-lettering.
    fn is_first_group(&self) -> bool {
        let depth = self.dispatcher.broker().config().topic_depth;
        self.registry
            .destinations()
            .into_iter()
            .find(|destination| {
                self.registry
                    .patterns_for(destination)
                    .into_iter()
                    .any(|p| topic_may_carry(p, &self.topic, depth))
            })
            .is_some_and(|first| first == self.group)
    }
}
