//! `Broker`: topic-addressed, partitioned publish/subscribe over a `LogStore`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, RwLock, Semaphore, broadcast};
use tracing::{debug, info, warn};

use crate::broker::log::{LogStore, RetentionPolicy};
use crate::broker::subscription::Subscription;
use crate::envelope::{self, Envelope, EventType};
use crate::error::BrokerError;
use crate::triggers::TypePattern;

/// Suffix appended to a topic to name its dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = "dead-letter";

/// Capacity of the new-topic announcement channel.
const TOPIC_EVENTS_CAPACITY: usize = 64;

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Partition count for auto-created topics.
    pub partitions: u32,
    /// A type's topic is its first `topic_depth` segments.
    pub topic_depth: usize,
    /// Appends allowed in flight at once.
    pub max_in_flight: usize,
    /// How long `publish` waits for an in-flight slot.
    pub publish_wait: Duration,
    /// Append attempts before `publish` reports `Unavailable`.
    pub publish_attempts: u32,
    /// Delay before the first append retry; doubles per retry.
    pub publish_backoff: Duration,
    /// Records fetched per partition per read.
    pub read_batch: usize,
    /// Subscriptions re-poll at least this often (recovers skipped partitions).
    pub idle_poll: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            partitions: 3,
            topic_depth: 3,
            max_in_flight: 64,
            publish_wait: Duration::from_secs(5),
            publish_attempts: 3,
            publish_backoff: Duration::from_millis(50),
            read_batch: 32,
            idle_poll: Duration::from_millis(500),
        }
    }
}

/// Where a published record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// Announcement of a newly created topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: u32,
}

/// The broker core.
pub struct Broker {
    log: Arc<dyn LogStore>,
    config: BrokerConfig,
    topics: RwLock<HashMap<String, u32>>,
    permits: Semaphore,
    round_robin: AtomicU64,
    appended: Notify,
    closed: AtomicBool,
    topic_tx: broadcast::Sender<TopicInfo>,
}

impl Broker {
    /// Open a broker over `log`, loading the topics it already holds.
    pub async fn open(log: Arc<dyn LogStore>, config: BrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let existing: HashMap<String, u32> = log.topics().await?.into_iter().collect();
        info!(
            topics = existing.len(),
            partitions = config.partitions,
            "Broker opened"
        );
        let (topic_tx, _rx) = broadcast::channel(TOPIC_EVENTS_CAPACITY);
        Ok(Arc::new(Self {
            log,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            config,
            topics: RwLock::new(existing),
            round_robin: AtomicU64::new(0),
            appended: Notify::new(),
            closed: AtomicBool::new(false),
            topic_tx,
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn log(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    pub(crate) fn appended(&self) -> &Notify {
        &self.appended
    }

    // ── Topics ──────────────────────────────────────────────────────

    /// The topic an event type is published on.
    pub fn topic_for(&self, event_type: &EventType) -> String {
        event_type.topic(self.config.topic_depth)
    }

    /// Dead-letter topic for `topic`.
    pub fn dead_letter_topic(topic: &str) -> String {
        format!("{topic}.{DEAD_LETTER_SUFFIX}")
    }

    pub fn is_dead_letter_topic(topic: &str) -> bool {
        topic
            .rsplit_once('.')
            .is_some_and(|(_, last)| last == DEAD_LETTER_SUFFIX)
    }

    /// Create a topic if missing. Returns its (possibly pre-existing) partition count.
    pub async fn create_topic(&self, topic: &str, partitions: u32) -> Result<u32, BrokerError> {
        if let Some(&count) = self.topics.read().await.get(topic) {
            return Ok(count);
        }

        let mut topics = self.topics.write().await;
        if let Some(&count) = topics.get(topic) {
            return Ok(count);
        }
        let count = self.log.create_topic(topic, partitions).await?;
        topics.insert(topic.to_string(), count);
        drop(topics);

        info!(topic, partitions = count, "Topic created");
        let _ = self.topic_tx.send(TopicInfo {
            name: topic.to_string(),
            partitions: count,
        });
        Ok(count)
    }

    /// Known topics and their partition counts, sorted by name.
    pub async fn topics(&self) -> Vec<TopicInfo> {
        let mut list: Vec<TopicInfo> = self
            .topics
            .read()
            .await
            .iter()
            .map(|(name, &partitions)| TopicInfo {
                name: name.clone(),
                partitions,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Receive an announcement for every topic created from now on.
    pub fn topic_events(&self) -> broadcast::Receiver<TopicInfo> {
        self.topic_tx.subscribe()
    }

    // ── Publish ─────────────────────────────────────────────────────

    /// Publish an envelope on the topic derived from its type.
    pub async fn publish_event(&self, envelope: &Envelope) -> Result<PublishReceipt, BrokerError> {
        let topic = self.topic_for(envelope.event_type());
        self.publish(&topic, envelope).await
    }

    /// Append an envelope to `topic`.
    ///
    /// The partition is a stable hash of the envelope's source, or
    /// round-robin when the source is empty. Waits a bounded time for an
    /// in-flight slot and retries a failing append a bounded number of
    /// times, then reports `Unavailable`.
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<PublishReceipt, BrokerError> {
        let bytes = envelope::encode(envelope)
            .map_err(|e| BrokerError::Storage(format!("encode envelope: {e}")))?;
        let partitions = self.create_topic(topic, self.config.partitions).await?;
        let partition = self.pick_partition(envelope.source(), partitions);

        let receipt = self.append(topic, partition, &bytes).await?;
        debug!(
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            topic,
            partition,
            offset = receipt.offset,
            "Event published"
        );
        Ok(receipt)
    }

    /// Append pre-encoded bytes to an explicit partition.
    ///
    /// The bytes are not validated; subscribers see undecodable records as
    /// malformed deliveries.
    pub async fn publish_raw(
        &self,
        topic: &str,
        partition: u32,
        bytes: &[u8],
    ) -> Result<PublishReceipt, BrokerError> {
        let partitions = self.create_topic(topic, self.config.partitions).await?;
        if partition >= partitions {
            return Err(BrokerError::UnknownTopic(format!("{topic}/{partition}")));
        }
        self.append(topic, partition, bytes).await
    }

    async fn append(&self, topic: &str, partition: u32, bytes: &[u8]) -> Result<PublishReceipt, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Unavailable("broker is closed".into()));
        }

        let _permit = match tokio::time::timeout(self.config.publish_wait, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BrokerError::Unavailable("publish semaphore closed".into())),
            Err(_) => {
                warn!(topic, "Publish backpressure: no in-flight slot");
                return Err(BrokerError::Unavailable(format!(
                    "no in-flight slot within {:?}",
                    self.config.publish_wait
                )));
            }
        };

        let attempts = self.config.publish_attempts.max(1);
        let mut delay = self.config.publish_backoff;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.log.append(topic, partition, bytes, Utc::now()).await {
                Ok(offset) => {
                    self.appended.notify_waiters();
                    return Ok(PublishReceipt {
                        topic: topic.to_string(),
                        partition,
                        offset,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(topic, partition, attempt, error = %e, "Append failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(BrokerError::Unavailable(match last_error {
            Some(e) => format!("append failed after {attempts} attempts: {e}"),
            None => format!("append failed after {attempts} attempts"),
        }))
    }

    fn pick_partition(&self, key: &str, partitions: u32) -> u32 {
        let partitions = partitions.max(1) as u64;
        if key.is_empty() {
            return (self.round_robin.fetch_add(1, Ordering::Relaxed) % partitions) as u32;
        }
        (fnv1a(key.as_bytes()) % partitions) as u32
    }

    // ── Subscribe / commit ──────────────────────────────────────────

    /// Subscribe `group` to every topic matching `topic_pattern`, including
    /// topics created later. Starts from the group's committed offsets.
    pub async fn subscribe(
        self: &Arc<Self>,
        group: &str,
        topic_pattern: TypePattern,
    ) -> Subscription {
        let topic_rx = self.topic_events();
        let mut subscription = Subscription::new(Arc::clone(self), group, Some(topic_pattern.clone()), Some(topic_rx));
        for topic in self.topics().await {
            if topic_pattern.matches(&topic.name) {
                subscription.add_topic(&topic.name, topic.partitions);
            }
        }
        subscription
    }

    /// Subscribe `group` to a single partition.
    pub fn subscribe_partition(self: &Arc<Self>, group: &str, topic: &str, partition: u32) -> Subscription {
        let mut subscription = Subscription::new(Arc::clone(self), group, None, None);
        subscription.add_partition(topic, partition);
        subscription
    }

    /// Persist `group`'s cursor: `next_offset` is the next record it will read.
    pub async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> Result<(), BrokerError> {
        self.log.commit(group, topic, partition, next_offset).await?;
        debug!(group, topic, partition, next_offset, "Offset committed");
        Ok(())
    }

    pub async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Option<u64>, BrokerError> {
        self.log.committed(group, topic, partition).await
    }

    pub async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        self.log.high_watermark(topic, partition).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Apply retention to every partition. Returns the number of records removed.
    pub async fn apply_retention(&self, policy: &RetentionPolicy) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for topic in self.topics().await {
            for partition in 0..topic.partitions {
                match self.log.trim(&topic.name, partition, policy, now).await {
                    Ok(n) => removed += n,
                    Err(e) => {
                        warn!(topic = %topic.name, partition, error = %e, "Retention trim failed");
                    }
                }
            }
        }
        removed
    }

    /// Stop accepting publishes and end all subscriptions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.appended.notify_waiters();
        info!("Broker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wake waiting subscriptions, e.g. after appending to the log directly.
    pub fn notify(&self) {
        self.appended.notify_waiters();
    }
}

/// 64-bit FNV-1a. Stable across processes and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}
