//! libSQL backend: durable `LogStore` implementation.
//!
//! Offsets are allocated from the `partitions.next_offset` counter rather than
//! `MAX(log_offset)`, so trimming the head of a partition never causes an
//! offset to be handed out twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params;
use tracing::debug;

use crate::broker::log::{LogStore, RetentionPolicy, StoredRecord};
use crate::error::BrokerError;
use crate::store::SqlDatabase;

/// Durable partitioned log stored in libSQL.
pub struct LibSqlLog {
    db: Arc<SqlDatabase>,
}

impl LibSqlLog {
    pub fn new(db: Arc<SqlDatabase>) -> Self {
        Self { db }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text comparison orders by time.
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn unavailable(op: &str, e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Unavailable(format!("{op}: {e}"))
}

fn partition_error(topic: &str, partition: u32, op: &str, e: impl std::fmt::Display) -> BrokerError {
    BrokerError::PartitionUnavailable {
        topic: topic.to_string(),
        partition,
        reason: format!("{op}: {e}"),
    }
}

fn row_to_record(row: &libsql::Row) -> Result<StoredRecord, libsql::Error> {
    let offset: i64 = row.get(0)?;
    let bytes: Vec<u8> = row.get(1)?;
    let appended_at: String = row.get(2)?;
    Ok(StoredRecord {
        offset: offset.max(0) as u64,
        bytes,
        appended_at: parse_time(&appended_at),
    })
}

/// Allocate the next offset of a partition and store the record under it.
async fn append_record(
    conn: &libsql::Connection,
    topic: &str,
    partition: u32,
    bytes: &[u8],
    appended_at: DateTime<Utc>,
) -> Result<u64, BrokerError> {
    let mut rows = conn
        .query(
            "UPDATE partitions SET next_offset = next_offset + 1
             WHERE topic = ?1 AND partition_id = ?2
             RETURNING next_offset - 1",
            params![topic, partition as i64],
        )
        .await
        .map_err(|e| partition_error(topic, partition, "append", e))?;

    let offset: i64 = match rows.next().await {
        Ok(Some(row)) => row
            .get(0)
            .map_err(|e| partition_error(topic, partition, "append row", e))?,
        Ok(None) => return Err(BrokerError::UnknownTopic(format!("{topic}/{partition}"))),
        Err(e) => return Err(partition_error(topic, partition, "append", e)),
    };
    drop(rows);

    conn.execute(
        "INSERT INTO records (topic, partition_id, log_offset, payload, appended_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![topic, partition as i64, offset, bytes.to_vec(), format_time(appended_at)],
    )
    .await
    .map_err(|e| partition_error(topic, partition, "append insert", e))?;

    Ok(offset as u64)
}

#[async_trait]
impl LogStore for LibSqlLog {
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<u32, BrokerError> {
        let _guard = self.db.lock_writes().await;
        let conn = self.db.conn();
        let partitions = partitions.max(1);

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO topics (name, partitions, created_at) VALUES (?1, ?2, ?3)",
                params![topic, partitions as i64, format_time(Utc::now())],
            )
            .await
            .map_err(|e| unavailable("create_topic", e))?;

        if inserted > 0 {
            for partition in 0..partitions {
                conn.execute(
                    "INSERT OR IGNORE INTO partitions (topic, partition_id, next_offset) VALUES (?1, ?2, 0)",
                    params![topic, partition as i64],
                )
                .await
                .map_err(|e| unavailable("create_topic partitions", e))?;
            }
            debug!(topic, partitions, "Topic created in DB");
        }

        let mut rows = conn
            .query(
                "SELECT partitions FROM topics WHERE name = ?1",
                params![topic],
            )
            .await
            .map_err(|e| unavailable("create_topic", e))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(|e| unavailable("create_topic row", e))?;
                Ok(count.max(1) as u32)
            }
            Ok(None) => Err(BrokerError::UnknownTopic(topic.to_string())),
            Err(e) => Err(unavailable("create_topic", e)),
        }
    }

    async fn topics(&self) -> Result<Vec<(String, u32)>, BrokerError> {
        let mut rows = self
            .db
            .conn()
            .query("SELECT name, partitions FROM topics ORDER BY name", ())
            .await
            .map_err(|e| unavailable("topics", e))?;

        let mut topics = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let name: String = row.get(0).map_err(|e| unavailable("topics row", e))?;
                    let partitions: i64 = row.get(1).map_err(|e| unavailable("topics row", e))?;
                    topics.push((name, partitions.max(1) as u32));
                }
                Ok(None) => break,
                Err(e) => return Err(unavailable("topics", e)),
            }
        }
        Ok(topics)
    }

    async fn append(
        &self,
        topic: &str,
        partition: u32,
        bytes: &[u8],
        appended_at: DateTime<Utc>,
    ) -> Result<u64, BrokerError> {
        let _guard = self.db.lock_writes().await;
        let tx = self
            .db
            .conn()
            .transaction()
            .await
            .map_err(|e| partition_error(topic, partition, "append begin", e))?;

        // Offset allocation and the insert commit together or not at all.
        match append_record(&tx, topic, partition, bytes, appended_at).await {
            Ok(offset) => {
                tx.commit()
                    .await
                    .map_err(|e| partition_error(topic, partition, "append commit", e))?;
                Ok(offset)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(topic, partition, error = %rollback, "Append rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<StoredRecord>, BrokerError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT log_offset, payload, appended_at FROM records
                 WHERE topic = ?1 AND partition_id = ?2 AND log_offset >= ?3
                 ORDER BY log_offset ASC LIMIT ?4",
                params![topic, partition as i64, from as i64, max as i64],
            )
            .await
            .map_err(|e| partition_error(topic, partition, "read", e))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => records.push(
                    row_to_record(&row).map_err(|e| partition_error(topic, partition, "read row", e))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(partition_error(topic, partition, "read", e)),
            }
        }
        Ok(records)
    }

    async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT next_offset FROM partitions WHERE topic = ?1 AND partition_id = ?2",
                params![topic, partition as i64],
            )
            .await
            .map_err(|e| partition_error(topic, partition, "high_watermark", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let next: i64 = row
                    .get(0)
                    .map_err(|e| partition_error(topic, partition, "high_watermark row", e))?;
                Ok(next.max(0) as u64)
            }
            Ok(None) => Err(BrokerError::UnknownTopic(format!("{topic}/{partition}"))),
            Err(e) => Err(partition_error(topic, partition, "high_watermark", e)),
        }
    }

    async fn trim(
        &self,
        topic: &str,
        partition: u32,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError> {
        let _guard = self.db.lock_writes().await;
        let conn = self.db.conn();
        let mut removed = 0u64;

        if let Some(cutoff) = policy.cutoff(now) {
            removed += conn
                .execute(
                    "DELETE FROM records WHERE topic = ?1 AND partition_id = ?2 AND appended_at < ?3",
                    params![topic, partition as i64, format_time(cutoff)],
                )
                .await
                .map_err(|e| partition_error(topic, partition, "trim by age", e))?;
        }

        if let Some(max) = policy.max_records {
            removed += conn
                .execute(
                    "DELETE FROM records WHERE topic = ?1 AND partition_id = ?2 AND log_offset NOT IN (
                        SELECT log_offset FROM records
                        WHERE topic = ?1 AND partition_id = ?2
                        ORDER BY log_offset DESC LIMIT ?3
                    )",
                    params![topic, partition as i64, max as i64],
                )
                .await
                .map_err(|e| partition_error(topic, partition, "trim by count", e))?;
        }

        Ok(removed as usize)
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> Result<(), BrokerError> {
        let _guard = self.db.lock_writes().await;
        self.db
            .conn()
            .execute(
                "INSERT INTO offsets (consumer_group, topic, partition_id, next_offset, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (consumer_group, topic, partition_id)
                 DO UPDATE SET next_offset = excluded.next_offset, updated_at = excluded.updated_at",
                params![
                    group,
                    topic,
                    partition as i64,
                    next_offset as i64,
                    format_time(Utc::now())
                ],
            )
            .await
            .map_err(|e| unavailable("commit", e))?;
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BrokerError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT next_offset FROM offsets WHERE consumer_group = ?1 AND topic = ?2 AND partition_id = ?3",
                params![group, topic, partition as i64],
            )
            .await
            .map_err(|e| unavailable("committed", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let next: i64 = row.get(0).map_err(|e| unavailable("committed row", e))?;
                Ok(Some(next.max(0) as u64))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(unavailable("committed", e)),
        }
    }
}
