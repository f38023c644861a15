//! `LogStore` trait: the storage seam under the broker.
//!
//! A log store holds, per (topic, partition), an append-only sequence of
//! encoded envelopes addressed by offset, plus the committed cursor of every
//! consumer group. Offsets are absolute and never reused, even after
//! retention trims the head of a partition.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BrokerError;

/// One record as stored in a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub offset: u64,
    /// Exact encoded envelope bytes, as appended.
    pub bytes: Vec<u8>,
    pub appended_at: DateTime<Utc>,
}

/// Time- and size-bounded retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Records older than this are trimmed.
    pub max_age: Option<Duration>,
    /// At most this many records are kept per partition.
    pub max_records: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(24 * 3600)),
            max_records: Some(100_000),
        }
    }
}

impl RetentionPolicy {
    /// Cutoff timestamp for `max_age`, relative to `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age)
    }
}

/// Backend-agnostic partitioned log with consumer-group offsets.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create a topic if missing. Returns the topic's partition count, which
    /// for an existing topic is the count it was created with.
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<u32, BrokerError>;

    /// All known topics with their partition counts.
    async fn topics(&self) -> Result<Vec<(String, u32)>, BrokerError>;

    /// Append encoded bytes to a partition. Returns the assigned offset.
    async fn append(
        &self,
        topic: &str,
        partition: u32,
        bytes: &[u8],
        appended_at: DateTime<Utc>,
    ) -> Result<u64, BrokerError>;

    /// Read up to `max` records with offset `>= from`, in offset order.
    /// Reads below the low watermark start at the low watermark.
    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<StoredRecord>, BrokerError>;

    /// Offset the next append will receive.
    async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64, BrokerError>;

    /// Apply retention to one partition. Returns the number of records removed.
    async fn trim(
        &self,
        topic: &str,
        partition: u32,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError>;

    /// Persist a consumer group's cursor (next unread offset).
    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> Result<(), BrokerError>;

    /// The committed cursor, if the group ever committed on this partition.
    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BrokerError>;
}
