//! Consumer-group subscriptions: a lazy, restartable stream of deliveries.
//!
//! A subscription keeps one cursor per (topic, partition). Cursors start at
//! the group's committed offset, advance as records are handed out, and can
//! be rewound to the committed offset to force redelivery. When nothing is
//! readable the subscription parks on the broker's append notification
//! instead of polling in a loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::broker::bus::{Broker, TopicInfo};
use crate::envelope::{self, Envelope};
use crate::error::{BrokerError, CodecError};
use crate::triggers::TypePattern;

/// One record handed to a consumer.
#[derive(Debug)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    /// Exact bytes stored in the log.
    pub bytes: Vec<u8>,
    /// Decoded envelope, or why the bytes could not be decoded.
    pub envelope: Result<Envelope, CodecError>,
}

impl Delivery {
    /// Offset to commit once this delivery is handled.
    pub fn next_offset(&self) -> u64 {
        self.offset + 1
    }
}

/// Per-partition read position. `None` means "load the committed offset".
type Cursors = BTreeMap<(String, u32), Option<u64>>;

pub struct Subscription {
    broker: Arc<Broker>,
    group: String,
    pattern: Option<TypePattern>,
    topic_rx: Option<broadcast::Receiver<TopicInfo>>,
    cursors: Cursors,
    buffer: VecDeque<Delivery>,
}

impl Subscription {
    pub(crate) fn new(
        broker: Arc<Broker>,
        group: &str,
        pattern: Option<TypePattern>,
        topic_rx: Option<broadcast::Receiver<TopicInfo>>,
    ) -> Self {
        Self {
            broker,
            group: group.to_string(),
            pattern,
            topic_rx,
            cursors: BTreeMap::new(),
            buffer: VecDeque::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Partitions this subscription reads, in (topic, partition) order.
    pub fn partitions(&self) -> Vec<(String, u32)> {
        self.cursors.keys().cloned().collect()
    }

    pub(crate) fn add_topic(&mut self, topic: &str, partitions: u32) {
        for partition in 0..partitions {
            self.add_partition(topic, partition);
        }
    }

    pub(crate) fn add_partition(&mut self, topic: &str, partition: u32) {
        self.cursors.entry((topic.to_string(), partition)).or_insert(None);
    }

    /// Next delivery, waiting for one if necessary.
    ///
    /// Returns `None` only once the broker is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Some(delivery);
            }
            if self.broker.is_closed() {
                return None;
            }

            // Register interest before reading so an append that lands
            // between the read and the wait still wakes us.
            let broker = Arc::clone(&self.broker);
            let notified = broker.appended().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.discover_topics().await;
            self.fill().await;

            if self.buffer.is_empty() && !broker.is_closed() {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(broker.config().idle_poll) => {}
                }
            }
        }
    }

    /// Turn the subscription into a `Stream` of deliveries.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|delivery| (delivery, subscription))
        })
    }

    /// Commit a handled delivery for this subscription's group.
    pub async fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.broker
            .commit(&self.group, &delivery.topic, delivery.partition, delivery.next_offset())
            .await
    }

    /// Drop buffered records of one partition and resume it from the
    /// committed offset.
    pub fn rewind(&mut self, topic: &str, partition: u32) {
        self.buffer
            .retain(|d| !(d.topic == topic && d.partition == partition));
        if let Some(cursor) = self.cursors.get_mut(&(topic.to_string(), partition)) {
            *cursor = None;
        }
        debug!(group = %self.group, topic, partition, "Subscription rewound");
    }

    /// Resume every partition from its committed offset.
    pub fn restart(&mut self) {
        self.buffer.clear();
        for cursor in self.cursors.values_mut() {
            *cursor = None;
        }
    }

    async fn discover_topics(&mut self) {
        let (Some(pattern), Some(rx)) = (self.pattern.as_ref(), self.topic_rx.as_mut()) else {
            return;
        };

        let mut found = Vec::new();
        let mut lagged = false;
        loop {
            match rx.try_recv() {
                Ok(info) => found.push(info),
                Err(broadcast::error::TryRecvError::Lagged(_)) => lagged = true,
                Err(_) => break,
            }
        }
        let pattern = pattern.clone();

        if lagged {
            found = self.broker.topics().await;
        }
        for info in found {
            if pattern.matches(&info.name) {
                self.add_topic(&info.name, info.partitions);
            }
        }
    }

    /// Read one batch from every partition. A failing partition is skipped
    /// and retried on the next call.
    async fn fill(&mut self) {
        let batch = self.broker.config().read_batch.max(1);
        let keys: Vec<(String, u32)> = self.cursors.keys().cloned().collect();

        for (topic, partition) in keys {
            let from = match self.position(&topic, partition).await {
                Ok(from) => from,
                Err(e) => {
                    warn!(group = %self.group, topic, partition, error = %e, "Cannot load committed offset");
                    continue;
                }
            };

            let records = match self.broker.log().read(&topic, partition, from, batch).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(group = %self.group, topic, partition, error = %e, "Partition read failed, skipping");
                    continue;
                }
            };

            if let Some(last) = records.last() {
                self.cursors
                    .insert((topic.clone(), partition), Some(last.offset + 1));
            }
            for record in records {
                let envelope = envelope::decode(&record.bytes);
                self.buffer.push_back(Delivery {
                    topic: topic.clone(),
                    partition,
                    offset: record.offset,
                    bytes: record.bytes,
                    envelope,
                });
            }
        }
    }

    async fn position(&mut self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        let key = (topic.to_string(), partition);
        if let Some(Some(next)) = self.cursors.get(&key) {
            return Ok(*next);
        }
        let committed = self
            .broker
            .committed(&self.group, topic, partition)
            .await?
            .unwrap_or(0);
        self.cursors.insert(key, Some(committed));
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::broker::{BrokerConfig, MemoryLog};
    use crate::envelope::{EventType, Source};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn setup(partitions: u32) -> (Arc<MemoryLog>, Arc<Broker>) {
        let log = Arc::new(MemoryLog::new());
        let config = BrokerConfig {
            partitions,
            idle_poll: Duration::from_millis(20),
            publish_backoff: Duration::from_millis(1),
            publish_attempts: 1,
            ..BrokerConfig::default()
        };
        let broker = Broker::open(log.clone(), config).await.unwrap();
        (log, broker)
    }

    fn event(n: u32) -> Envelope {
        Envelope::new(
            EventType::parse("com.learning.message.received").unwrap(),
            &Source::new("/services/producer"),
            serde_json::json!({"n": n}),
        )
    }

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(TEST_TIMEOUT, sub.next())
            .await
            .expect("timed out waiting for delivery")
            .expect("subscription ended")
    }

    #[tokio::test]
    async fn redelivery_after_crash_is_byte_identical() {
        let (_log, broker) = setup(1).await;
        let published = event(1);
        broker.publish_event(&published).await.unwrap();

        let pattern = TypePattern::parse("com.learning.message").unwrap();
        let first = {
            let mut sub = broker.subscribe("g", pattern.clone()).await;
            next(&mut sub).await
            // dropped without commit: simulated crash
        };

        let mut sub = broker.subscribe("g", pattern).await;
        let again = next(&mut sub).await;
        assert_eq!(again.offset, first.offset);
        assert_eq!(again.bytes, first.bytes);
        assert_eq!(again.envelope.unwrap(), published);
    }

    #[tokio::test]
    async fn commit_advances_restart_position() {
        let (_log, broker) = setup(1).await;
        broker.publish_event(&event(1)).await.unwrap();
        broker.publish_event(&event(2)).await.unwrap();

        let pattern = TypePattern::parse("com.learning.message").unwrap();
        let mut sub = broker.subscribe("g", pattern.clone()).await;
        let first = next(&mut sub).await;
        sub.commit(&first).await.unwrap();
        drop(sub);

        let mut sub = broker.subscribe("g", pattern).await;
        assert_eq!(next(&mut sub).await.offset, 1);
    }

    #[tokio::test]
    async fn groups_have_independent_offsets() {
        let (_log, broker) = setup(1).await;
        broker.publish_event(&event(1)).await.unwrap();
        let pattern = TypePattern::parse("com.learning.*").unwrap();

        let mut a = broker.subscribe("a", pattern.clone()).await;
        let d = next(&mut a).await;
        a.commit(&d).await.unwrap();

        let mut b = broker.subscribe("b", pattern).await;
        assert_eq!(next(&mut b).await.offset, 0);
    }

    #[tokio::test]
    async fn wakes_on_publish_and_discovers_new_topics() {
        let (_log, broker) = setup(1).await;
        let mut sub = broker.subscribe("g", TypePattern::Any).await;
        assert!(sub.partitions().is_empty());

        let publisher = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publisher.publish_event(&event(7)).await.unwrap();
        });

        let d = next(&mut sub).await;
        assert_eq!(d.topic, "com.learning.message");
        assert_eq!(d.envelope.unwrap().payload()["n"], 7);
    }

    #[tokio::test]
    async fn unavailable_partition_does_not_block_others() {
        let (log, broker) = setup(2).await;
        broker.create_topic("t", 2).await.unwrap();
        broker.publish_raw("t", 0, b"{}").await.unwrap();
        broker.publish_raw("t", 1, b"{}").await.unwrap();
        log.set_partition_available("t", 0, false);

        let mut sub = broker.subscribe("g", TypePattern::parse("t").unwrap()).await;
        let d = next(&mut sub).await;
        assert_eq!(d.partition, 1);

        log.set_partition_available("t", 0, true);
        let d = next(&mut sub).await;
        assert_eq!(d.partition, 0);
    }

    #[tokio::test]
    async fn undecodable_record_surfaces_as_codec_error() {
        let (_log, broker) = setup(1).await;
        broker.publish_raw("t", 0, b"not json").await.unwrap();
        let mut sub = broker.subscribe_partition("g", "t", 0);
        let d = next(&mut sub).await;
        assert!(matches!(d.envelope, Err(CodecError::MalformedEnvelope(_))));
        assert_eq!(d.bytes, b"not json");
    }

    #[tokio::test]
    async fn rewind_redelivers_from_committed() {
        let (_log, broker) = setup(1).await;
        for n in 0..3 {
            broker.publish_event(&event(n)).await.unwrap();
        }
        let mut sub = broker.subscribe_partition("g", "com.learning.message", 0);
        let d0 = next(&mut sub).await;
        sub.commit(&d0).await.unwrap();
        let d1 = next(&mut sub).await;
        assert_eq!(d1.offset, 1);

        sub.rewind("com.learning.message", 0);
        assert_eq!(next(&mut sub).await.offset, 1);
    }

    #[tokio::test]
    async fn stream_ends_when_broker_closes() {
        let (_log, broker) = setup(1).await;
        broker.publish_raw("t", 0, b"{}").await.unwrap();
        let stream = broker.subscribe_partition("g", "t", 0).into_stream();
        broker.close();

        let items: Vec<Delivery> = tokio::time::timeout(TEST_TIMEOUT, stream.collect())
            .await
            .unwrap();
        assert!(items.is_empty());
    }
}
