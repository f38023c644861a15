//! Worker pool: keeps one `PartitionWorker` running per (group, topic,
//! partition) that can carry events the group wants, including topics
//! created after startup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, TopicInfo};
use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::worker::PartitionWorker;
use crate::triggers::{Destination, TriggerRegistry, TypePattern};

type WorkerKey = (Destination, String, u32);

pub struct WorkerPool {
    broker: Arc<Broker>,
    registry: Arc<TriggerRegistry>,
    dispatcher: Arc<Dispatcher>,
    workers: Mutex<HashMap<WorkerKey, JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(registry: Arc<TriggerRegistry>, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            broker: Arc::clone(dispatcher.broker()),
            registry,
            dispatcher,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Start workers for every existing topic, then watch for new ones.
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut topic_rx = self.broker.topic_events();
        for topic in self.broker.topics().await {
            self.spawn_for_topic(&topic).await;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match topic_rx.recv().await {
                    Ok(topic) => pool.spawn_for_topic(&topic).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Topic announcements lagged, rescanning");
                        for topic in pool.broker.topics().await {
                            pool.spawn_for_topic(&topic).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if pool.broker.is_closed() {
                    break;
                }
            }
            debug!("Topic watcher stopped");
        })
    }

    async fn spawn_for_topic(&self, topic: &TopicInfo) {
        let depth = self.broker.config().topic_depth;
        let mut workers = self.workers.lock().await;

        for destination in self.registry.destinations() {
            let wanted = self
                .registry
                .patterns_for(&destination)
                .into_iter()
                .any(|p| topic_may_carry(p, &topic.name, depth));
            if !wanted {
                continue;
            }

            for partition in 0..topic.partitions {
                let key = (destination.clone(), topic.name.clone(), partition);
                if workers.contains_key(&key) {
                    continue;
                }
                let worker = PartitionWorker::new(
                    destination.clone(),
                    topic.name.clone(),
                    partition,
                    Arc::clone(&self.registry),
                    Arc::clone(&self.dispatcher),
                );
                workers.insert(key, tokio::spawn(worker.run()));
            }
            info!(
                group = %destination,
                topic = %topic.name,
                partitions = topic.partitions,
                "Workers started"
            );
        }
    }

    /// Number of running workers.
    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }

    /// Close the broker and wait for every worker to finish its current record.
    pub async fn shutdown(&self) {
        self.broker.close();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        info!("Worker pool stopped");
    }
}

/// Whether events matching `pattern` can be published on `topic`, given
/// that a type's topic is its first `depth` segments.
pub fn topic_may_carry(pattern: &TypePattern, topic: &str, depth: usize) -> bool {
    let truncate = |name: &str| name.split('.').take(depth.max(1)).collect::<Vec<_>>().join(".");
    match pattern {
        TypePattern::Any => true,
        TypePattern::Exact(name) => truncate(name) == topic,
        TypePattern::Children(prefix) => {
            if prefix.split('.').count() >= depth {
                truncate(prefix) == topic
            } else {
                pattern.matches(topic)
            }
        }
    }
}
