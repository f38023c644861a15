//! In-memory `LogStore` for tests and single-process runs.
//!
//! Also supports fault injection: the whole store can be taken offline, or a
//! single partition made unavailable, to exercise broker failure semantics.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::RwLock as StdRwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::broker::log::{LogStore, RetentionPolicy, StoredRecord};
use crate::error::BrokerError;

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of the first record in `records`.
    base: u64,
    records: VecDeque<StoredRecord>,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn pop_front(&mut self) {
        if self.records.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    topics: BTreeMap<String, Vec<PartitionLog>>,
    offsets: HashMap<(String, String, u32), u64>,
}

/// In-memory partitioned log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: RwLock<MemoryState>,
    offline: AtomicBool,
    unavailable: StdRwLock<HashSet<(String, u32)>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the log becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Simulate one partition failing while the rest of the topic works.
    pub fn set_partition_available(&self, topic: &str, partition: u32, available: bool) {
        if let Ok(mut set) = self.unavailable.write() {
            let key = (topic.to_string(), partition);
            if available {
                set.remove(&key);
            } else {
                set.insert(key);
            }
        }
    }

    fn check_online(&self) -> Result<(), BrokerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory log is offline".into()));
        }
        Ok(())
    }

    fn check_partition(&self, topic: &str, partition: u32) -> Result<(), BrokerError> {
        self.check_online()?;
        let down = self
            .unavailable
            .read()
            .map(|set| set.contains(&(topic.to_string(), partition)))
            .unwrap_or(false);
        if down {
            return Err(BrokerError::PartitionUnavailable {
                topic: topic.to_string(),
                partition,
                reason: "partition marked unavailable".into(),
            });
        }
        Ok(())
    }
}

fn unknown_partition(topic: &str, partition: u32) -> BrokerError {
    BrokerError::UnknownTopic(format!("{topic}/{partition}"))
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<u32, BrokerError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let logs = state.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions.max(1))
                .map(|_| PartitionLog::default())
                .collect()
        });
        Ok(logs.len() as u32)
    }

    async fn topics(&self) -> Result<Vec<(String, u32)>, BrokerError> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .topics
            .iter()
            .map(|(name, logs)| (name.clone(), logs.len() as u32))
            .collect())
    }

    async fn append(
        &self,
        topic: &str,
        partition: u32,
        bytes: &[u8],
        appended_at: DateTime<Utc>,
    ) -> Result<u64, BrokerError> {
        self.check_partition(topic, partition)?;
        let mut state = self.state.write().await;
        let log = state
            .topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
            .ok_or_else(|| unknown_partition(topic, partition))?;

        let offset = log.next_offset();
        log.records.push_back(StoredRecord {
            offset,
            bytes: bytes.to_vec(),
            appended_at,
        });
        Ok(offset)
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<StoredRecord>, BrokerError> {
        self.check_partition(topic, partition)?;
        let state = self.state.read().await;
        let log = state
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .ok_or_else(|| unknown_partition(topic, partition))?;

        let start = from.saturating_sub(log.base) as usize;
        Ok(log.records.iter().skip(start).take(max).cloned().collect())
    }

    async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        self.check_partition(topic, partition)?;
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .map(PartitionLog::next_offset)
            .ok_or_else(|| unknown_partition(topic, partition))
    }

    async fn trim(
        &self,
        topic: &str,
        partition: u32,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError> {
        self.check_partition(topic, partition)?;
        let mut state = self.state.write().await;
        let log = state
            .topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
            .ok_or_else(|| unknown_partition(topic, partition))?;

        let mut removed = 0;
        if let Some(cutoff) = policy.cutoff(now) {
            while log
                .records
                .front()
                .is_some_and(|r| r.appended_at < cutoff)
            {
                log.pop_front();
                removed += 1;
            }
        }
        if let Some(max) = policy.max_records {
            while log.records.len() > max {
                log.pop_front();
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> Result<(), BrokerError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        state
            .offsets
            .insert((group.to_string(), topic.to_string(), partition), next_offset);
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BrokerError> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }
}
