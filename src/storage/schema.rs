use std::collections::HashSet;

use libsql::{params, Connection};

use super::StorageError;

const MIGRATION_TABLE: &str = "schema_migrations";

pub(crate) const REQUIRED_TABLES: &[&str] = &[MIGRATION_TABLE, "sessions", "samples", "aggregates"];

#[derive(Debug, Clone, Copy)]
pub(crate) struct Migration {
    pub(crate) version: &'static str,
    pub(crate) sql: &'static str,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_create_sessions_table",
        sql: include_str!("../../migrations/0001_create_sessions_table.sql"),
    },
    Migration {
        version: "0002_create_samples_table",
        sql: include_str!("../../migrations/0002_create_samples_table.sql"),
    },
    Migration {
        version: "0003_create_aggregates_table",
        sql: include_str!("../../migrations/0003_create_aggregates_table.sql"),
    },
    Migration {
        version: "0004_create_lookup_indexes",
        sql: include_str!("../../migrations/0004_create_lookup_indexes.sql"),
    },
];

pub(crate) fn initialization_error(message: String) -> StorageError {
    StorageError::Initialization { message }
}

pub(crate) fn migration_error(message: String) -> StorageError {
    StorageError::Migration { message }
}

pub(crate) async fn rollback_quietly(conn: &Connection) {
    let _ = conn.execute("ROLLBACK TRANSACTION", params![]).await;
}

pub(crate) async fn configure_connection(conn: &Connection) -> Result<(), StorageError> {
    conn.execute("PRAGMA foreign_keys = ON", params![])
        .await
        .map_err(|error| initialization_error(error.to_string()))?;
    // busy_timeout and journal_mode return a row, so they go through query().
    let mut rows = conn
        .query("PRAGMA busy_timeout = 5000", params![])
        .await
        .map_err(|error| initialization_error(error.to_string()))?;
    let _ = rows.next().await;
    Ok(())
}

/// WAL lets readers proceed while the ingest path holds the write lock.
pub(crate) async fn enable_wal_mode(conn: &Connection) -> Result<(), StorageError> {
    let mut rows = conn
        .query("PRAGMA journal_mode = WAL", params![])
        .await
        .map_err(|error| initialization_error(format!("failed to enable WAL mode: {error}")))?;
    let _ = rows.next().await;
    Ok(())
}

pub(crate) async fn run_pending_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        params![],
    )
    .await
    .map_err(|error| migration_error(error.to_string()))?;

    let applied = applied_versions(conn).await?;
    for migration in MIGRATIONS {
        if applied.contains(migration.version) {
            continue;
        }

        conn.execute("BEGIN IMMEDIATE TRANSACTION", params![])
            .await
            .map_err(|error| migration_error(error.to_string()))?;
        let result = async {
            conn.execute_batch(migration.sql)
                .await
                .map_err(|error| migration_error(error.to_string()))?;
            conn.execute(
                "INSERT INTO schema_migrations (version) VALUES (?1)",
                params![migration.version],
            )
            .await
            .map_err(|error| migration_error(error.to_string()))?;
            Ok::<(), StorageError>(())
        }
        .await;
        if let Err(error) = result {
            rollback_quietly(conn).await;
            return Err(error);
        }
        conn.execute("COMMIT TRANSACTION", params![])
            .await
            .map_err(|error| migration_error(error.to_string()))?;
        tracing::debug!(version = migration.version, "applied migration");
    }
    Ok(())
}

async fn applied_versions(conn: &Connection) -> Result<HashSet<String>, StorageError> {
    let mut rows = conn
        .query("SELECT version FROM schema_migrations", params![])
        .await
        .map_err(|error| migration_error(error.to_string()))?;

    let mut versions = HashSet::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|error| migration_error(error.to_string()))?
    {
        let version = row
            .get::<String>(0)
            .map_err(|error| migration_error(error.to_string()))?;
        versions.insert(version);
    }
    Ok(versions)
}

pub(crate) async fn verify_required_schema(conn: &Connection) -> Result<(), StorageError> {
    for table in REQUIRED_TABLES {
        let mut rows = conn
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
                params![*table],
            )
            .await
            .map_err(|error| initialization_error(error.to_string()))?;
        let found = rows
            .next()
            .await
            .map_err(|error| initialization_error(error.to_string()))?
            .is_some();
        if !found {
            return Err(initialization_error(format!(
                "required table `{table}` is missing after migration"
            )));
        }
    }
    Ok(())
}
