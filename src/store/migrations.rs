//! Version-tracked schema migrations for the libSQL store.
//!
//! Each migration has a version number and SQL. `run_migrations()` reads the
//! current version from `_migrations` and applies only newer steps, in order.

use libsql::Connection;

use crate::error::BrokerError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "broker_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS topics (
                name TEXT PRIMARY KEY,
                partitions INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS partitions (
                topic TEXT NOT NULL REFERENCES topics(name) ON DELETE CASCADE,
                partition_id INTEGER NOT NULL,
                next_offset INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (topic, partition_id)
            );

            CREATE TABLE IF NOT EXISTS records (
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                log_offset INTEGER NOT NULL,
                payload BLOB NOT NULL,
                appended_at TEXT NOT NULL,
                PRIMARY KEY (topic, partition_id, log_offset)
            );
            CREATE INDEX IF NOT EXISTS idx_records_appended ON records(appended_at);

            CREATE TABLE IF NOT EXISTS offsets (
                consumer_group TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                next_offset INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (consumer_group, topic, partition_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "customers",
        sql: r#"
            CREATE TABLE IF NOT EXISTS customers (
                customer_id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                company_name TEXT,
                country TEXT,
                phone TEXT,
                account_status TEXT NOT NULL DEFAULT 'active',
                total_purchases REAL NOT NULL DEFAULT 0,
                last_purchase_date TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_customers_email ON customers(email);
        "#,
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), BrokerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| BrokerError::Storage(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                BrokerError::Storage(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "Database migrations complete"
    );
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, BrokerError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| BrokerError::Storage(format!("Failed to query migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| BrokerError::Storage(format!("Failed to parse migration version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(BrokerError::Storage(format!(
            "Failed to read migration version: {e}"
        ))),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), BrokerError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| BrokerError::Storage(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
