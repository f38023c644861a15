//! Persistence layer: libSQL-backed broker log and customer table.

pub mod libsql_log;
pub mod migrations;

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase};
use tracing::info;

use crate::error::BrokerError;

pub use libsql_log::LibSqlLog;

/// Shared libSQL handle.
///
/// One connection is reused by every component; `libsql::Connection` is safe
/// for concurrent async use. Every write takes `write_lock`, so none lands
/// inside another write's transaction.
pub struct SqlDatabase {
    /// Keeps the database open for `conn`.
    _db: LibSqlDatabase,
    conn: Connection,
    write_lock: tokio::sync::Mutex<()>,
}

impl SqlDatabase {
    /// Open (or create) a local database file and run migrations.
    pub async fn open_local(path: &Path) -> Result<Arc<Self>, BrokerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BrokerError::Storage(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to open libSQL database: {e}")))?;
        let handle = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(handle)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory() -> Result<Arc<Self>, BrokerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                BrokerError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Arc<Self>, BrokerError> {
        let conn = db
            .connect()
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Arc::new(Self {
            _db: db,
            conn,
            write_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) async fn lock_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}
