//! libSQL-backed customer lookup over the `customers` table.

use std::sync::Arc;

use async_trait::async_trait;
use libsql::params;
use tracing::debug;

use super::{CustomerLookup, CustomerRecord, normalize_key};
use crate::error::LookupError;
use crate::store::SqlDatabase;

pub struct LibSqlLookup {
    db: Arc<SqlDatabase>,
}

impl LibSqlLookup {
    pub fn new(db: Arc<SqlDatabase>) -> Self {
        Self { db }
    }

    /// Insert or replace a customer, keyed by email.
    pub async fn upsert(&self, record: &CustomerRecord) -> Result<(), LookupError> {
        let _guard = self.db.lock_writes().await;
        self.db
            .conn()
            .execute(
                "INSERT INTO customers (customer_id, email, first_name, last_name, company_name,
                    country, phone, account_status, total_purchases, last_purchase_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (email) DO UPDATE SET
                    first_name = excluded.first_name,
                    last_name = excluded.last_name,
                    company_name = excluded.company_name,
                    country = excluded.country,
                    phone = excluded.phone,
                    account_status = excluded.account_status,
                    total_purchases = excluded.total_purchases,
                    last_purchase_date = excluded.last_purchase_date",
                params![
                    record.customer_id,
                    normalize_key(&record.email),
                    record.first_name.as_str(),
                    record.last_name.as_str(),
                    opt_text(record.company_name.as_deref()),
                    opt_text(record.country.as_deref()),
                    opt_text(record.phone.as_deref()),
                    record.account_status.as_str(),
                    record.total_purchases,
                    opt_text(record.last_purchase_date.as_deref())
                ],
            )
            .await
            .map_err(|e| LookupError::Unavailable(format!("upsert customer: {e}")))?;
        Ok(())
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Nullable columns read as `None`.
fn row_to_customer(row: &libsql::Row) -> Result<CustomerRecord, libsql::Error> {
    Ok(CustomerRecord {
        customer_id: row.get(0)?,
        email: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        company_name: row.get(4).ok(),
        country: row.get(5).ok(),
        phone: row.get(6).ok(),
        account_status: row.get(7)?,
        total_purchases: row.get(8)?,
        last_purchase_date: row.get(9).ok(),
    })
}

#[async_trait]
impl CustomerLookup for LibSqlLookup {
    async fn find_by_key(&self, key: &str) -> Result<Option<CustomerRecord>, LookupError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT customer_id, email, first_name, last_name, company_name, country, phone,
                        account_status, total_purchases, last_purchase_date
                 FROM customers WHERE email = ?1",
                params![normalize_key(key)],
            )
            .await
            .map_err(|e| LookupError::Unavailable(format!("query customers: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_customer(&row)
                    .map_err(|e| LookupError::Unavailable(format!("parse customer row: {e}")))?;
                debug!(customer_id = record.customer_id, "Customer found");
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LookupError::Unavailable(format!("read customers: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::sample_customer;

    #[tokio::test]
    async fn upsert_then_find() {
        let lookup = LibSqlLookup::new(SqlDatabase::open_memory().await.unwrap());
        lookup.upsert(&sample_customer("John.Doe@example.com")).await.unwrap();

        let found = lookup.find_by_key("john.doe@example.com").await.unwrap().unwrap();
        assert_eq!(found.first_name, "John");
        assert_eq!(found.company_name.as_deref(), Some("Acme Corp"));
        assert_eq!(found.total_purchases, 1250.5);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let lookup = LibSqlLookup::new(SqlDatabase::open_memory().await.unwrap());
        assert!(lookup.find_by_key("ghost@example.com").await.unwrap().is_none());
    }
}
