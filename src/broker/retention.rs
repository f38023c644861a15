//! Periodic retention task.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::bus::Broker;
use crate::broker::log::RetentionPolicy;

/// Spawn a background task that trims every partition on a fixed interval.
pub fn spawn_retention_task(
    broker: Arc<Broker>,
    policy: RetentionPolicy,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // `interval` panics on a zero period.
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        loop {
            interval.tick().await;
            if broker.is_closed() {
                debug!("Broker closed, retention task exiting");
                break;
            }
            let removed = broker.apply_retention(&policy).await;
            if removed > 0 {
                info!(removed, "Retention trimmed records");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, MemoryLog};

    #[tokio::test]
    async fn task_trims_and_exits_on_close() {
        let log = Arc::new(MemoryLog::new());
        let broker = Broker::open(log, BrokerConfig::default()).await.unwrap();
        broker.create_topic("t", 1).await.unwrap();
        for _ in 0..5 {
            broker.publish_raw("t", 0, b"{}").await.unwrap();
        }

        let policy = RetentionPolicy {
            max_age: None,
            max_records: Some(2),
        };
        let handle = spawn_retention_task(Arc::clone(&broker), policy, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = broker.log().read("t", 0, 0, 10).await.unwrap();
        assert_eq!(records.len(), 2);

        broker.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
