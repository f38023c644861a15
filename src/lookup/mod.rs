//! Keyed customer lookup used by the enrichment stage.
//!
//! A missing key is `Ok(None)`: a normal outcome, not an error. Only an
//! unreachable store is an error, and the enricher reports it as transient.

pub mod libsql_lookup;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::LookupError;

pub use libsql_lookup::LibSqlLookup;

/// A customer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company_name: Option<String>,
    pub country: Option<String>,
    pub phone: Option<String>,
    pub account_status: String,
    pub total_purchases: f64,
    pub last_purchase_date: Option<String>,
}

/// Read-only keyed lookup.
#[async_trait]
pub trait CustomerLookup: Send + Sync {
    async fn find_by_key(&self, key: &str) -> Result<Option<CustomerRecord>, LookupError>;
}

/// Lookup keys are emails, compared case-insensitively.
pub(crate) fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// In-memory lookup for tests and demo runs.
#[derive(Debug, Default)]
pub struct MemoryLookup {
    records: RwLock<HashMap<String, CustomerRecord>>,
    offline: AtomicBool,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: CustomerRecord) {
        self.records
            .write()
            .await
            .insert(normalize_key(&record.email), record);
    }

    /// Simulate the store being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl CustomerLookup for MemoryLookup {
    async fn find_by_key(&self, key: &str) -> Result<Option<CustomerRecord>, LookupError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LookupError::Unavailable("memory lookup is offline".into()));
        }
        Ok(self.records.read().await.get(&normalize_key(key)).cloned())
    }
}

#[cfg(test)]
pub(crate) fn sample_customer(email: &str) -> CustomerRecord {
    CustomerRecord {
        customer_id: 1001,
        email: email.to_string(),
        first_name: "John".into(),
        last_name: "Doe".into(),
        company_name: Some("Acme Corp".into()),
        country: Some("USA".into()),
        phone: Some("555-123-4567".into()),
        account_status: "active".into(),
        total_purchases: 1250.5,
        last_purchase_date: Some("2024-01-15".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn found_and_not_found() {
        let lookup = MemoryLookup::new();
        lookup.insert(sample_customer("john.doe@example.com")).await;

        let found = lookup.find_by_key("John.Doe@Example.com").await.unwrap();
        assert_eq!(found.unwrap().customer_id, 1001);
        assert!(lookup.find_by_key("nobody@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_is_an_error() {
        let lookup = MemoryLookup::new();
        lookup.set_offline(true);
        assert!(matches!(
            lookup.find_by_key("a@b.com").await,
            Err(LookupError::Unavailable(_))
        ));
    }
}
