//! Broker core: durable, partitioned, topic-addressed log with
//! consumer-group offsets and at-least-once delivery.

pub mod bus;
pub mod log;
pub mod memory;
pub mod retention;
pub mod subscription;

pub use bus::{Broker, BrokerConfig, PublishReceipt, TopicInfo};
pub use log::{LogStore, RetentionPolicy, StoredRecord};
pub use memory::MemoryLog;
pub use retention::spawn_retention_task;
pub use subscription::{Delivery, Subscription};
