use std::path::Path;

use async_trait::async_trait;
use libsql::{params, Builder, Connection, Database, Value};
use tokio::sync::Mutex;

use super::schema::{
    configure_connection, enable_wal_mode, initialization_error, rollback_quietly,
    run_pending_migrations, verify_required_schema,
};
use super::{
    OpenSession, SampleRange, SessionFilter, SessionRecord, SessionStats, SessionSummary,
    StorageError, Store,
};
use crate::core::aggregate::Aggregate;
use crate::core::sample::{ContactStatus, Sample};

fn query_error(message: String) -> StorageError {
    StorageError::Query { message }
}

fn connection_error(message: String) -> StorageError {
    StorageError::Connection { message }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Map a write-path failure, keeping lock contention distinguishable.
fn write_error(context: &str, error: libsql::Error) -> StorageError {
    match error {
        libsql::Error::SqliteFailure(code, message)
            if matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED) =>
        {
            StorageError::Busy {
                message: format!("{context}: {message}"),
            }
        }
        other => query_error(format!("{context}: {other}")),
    }
}

const SAMPLE_COLUMNS: &str = "timestamp, heart_rate_bpm, rr_intervals, hrv_rmssd_ms, speed_mps,
    cadence_spm, stride_length_cm, total_distance_m, battery_pct, contact_status,
    is_running, raw_payload";

const AGGREGATE_COLUMNS: &str = "session_id, interval_start, interval_width, avg_hr, min_hr,
    max_hr, avg_speed, max_speed, avg_cadence, max_distance, sample_count";

/// SQLite-backed [`Store`] on a single libsql connection.
///
/// Multi-statement writes run inside `BEGIN IMMEDIATE` transactions,
/// serialized by `write_lock` since every caller shares the connection.
pub struct LibsqlStore {
    _db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibsqlStore {
    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                initialization_error(format!(
                    "failed to prepare database directory `{}`: {error}",
                    parent.display()
                ))
            })?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|error| connection_error(error.to_string()))?;
        let store = Self::from_database(db).await?;
        enable_wal_mode(&store.conn).await?;
        tracing::info!(path = %path.display(), "opened sample database");
        Ok(store)
    }

    /// Fresh private database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|error| connection_error(error.to_string()))?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self, StorageError> {
        let conn = db
            .connect()
            .map_err(|error| connection_error(error.to_string()))?;
        configure_connection(&conn).await?;
        run_pending_migrations(&conn).await?;
        verify_required_schema(&conn).await?;
        Ok(Self {
            _db: db,
            conn,
            write_lock: Mutex::new(()),
        })
    }

    async fn begin(&self) -> Result<(), StorageError> {
        self.conn
            .execute("BEGIN IMMEDIATE TRANSACTION", params![])
            .await
            .map_err(|e| write_error("failed to begin transaction", e))?;
        Ok(())
    }

    async fn commit(&self) -> Result<(), StorageError> {
        self.conn
            .execute("COMMIT TRANSACTION", params![])
            .await
            .map_err(|e| write_error("failed to commit transaction", e))?;
        Ok(())
    }

    async fn insert_sample(&self, session_id: &str, sample: &Sample) -> Result<(), StorageError> {
        let rr_intervals = if sample.rr_intervals.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&sample.rr_intervals)?)
        };
        self.conn
            .execute(
                "INSERT INTO samples (
                    session_id, timestamp, heart_rate_bpm, rr_intervals, hrv_rmssd_ms,
                    speed_mps, cadence_spm, stride_length_cm, total_distance_m,
                    battery_pct, contact_status, is_running, raw_payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    session_id,
                    sample.timestamp,
                    sample.heart_rate_bpm.map(i64::from),
                    rr_intervals,
                    sample.hrv_rmssd_ms,
                    sample.speed_mps,
                    sample.cadence_spm.map(i64::from),
                    sample.stride_length_cm.map(i64::from),
                    sample.total_distance_m,
                    sample.battery_pct.map(i64::from),
                    sample.contact_status.code(),
                    i64::from(sample.is_running),
                    sample.raw_payload.as_deref(),
                ],
            )
            .await
            .map_err(|e| write_error("failed to insert sample", e))?;
        Ok(())
    }

    async fn upsert_aggregate(&self, aggregate: &Aggregate) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO aggregates (
                    session_id, interval_start, interval_width, avg_hr, min_hr, max_hr,
                    avg_speed, max_speed, avg_cadence, max_distance, sample_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(session_id, interval_start, interval_width) DO UPDATE SET
                    avg_hr = excluded.avg_hr,
                    min_hr = excluded.min_hr,
                    max_hr = excluded.max_hr,
                    avg_speed = excluded.avg_speed,
                    max_speed = excluded.max_speed,
                    avg_cadence = excluded.avg_cadence,
                    max_distance = excluded.max_distance,
                    sample_count = excluded.sample_count,
                    updated_at = CURRENT_TIMESTAMP",
                params![
                    aggregate.session_id.as_str(),
                    aggregate.interval_start,
                    i64::from(aggregate.interval_width),
                    aggregate.avg_hr,
                    i64::from(aggregate.min_hr),
                    i64::from(aggregate.max_hr),
                    aggregate.avg_speed,
                    aggregate.max_speed,
                    aggregate.avg_cadence,
                    aggregate.max_distance,
                    i64::from(aggregate.sample_count),
                ],
            )
            .await
            .map_err(|e| write_error("failed to upsert aggregate", e))?;
        Ok(())
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, StorageError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM sessions WHERE session_id = ?1 LIMIT 1",
                params![session_id],
            )
            .await
            .map_err(|e| query_error(format!("failed to look up session: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| query_error(e.to_string()))?
            .is_some())
    }
}

#[async_trait]
impl Store for LibsqlStore {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.begin().await?;
        let result = async {
            // A crash can leave a device's previous session open; close it at
            // its last sample so only the new one stays open.
            self.conn
                .execute(
                    "UPDATE sessions SET
                        end_time = COALESCE(
                            (SELECT MAX(timestamp) FROM samples
                             WHERE samples.session_id = sessions.session_id),
                            start_time),
                        updated_at = CURRENT_TIMESTAMP
                     WHERE device_id = ?1 AND end_time IS NULL AND session_id != ?2",
                    params![session.device_id.as_str(), session.session_id.as_str()],
                )
                .await
                .map_err(|e| write_error("failed to close stale sessions", e))?;
            self.conn
                .execute(
                    "INSERT INTO sessions (session_id, device_id, device_name, start_time, end_time)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(session_id) DO NOTHING",
                    params![
                        session.session_id.as_str(),
                        session.device_id.as_str(),
                        session.device_name.as_deref(),
                        session.start_time,
                        session.end_time,
                    ],
                )
                .await
                .map_err(|e| write_error("failed to create session", e))?;
            Ok::<(), StorageError>(())
        }
        .await;
        if let Err(error) = result {
            rollback_quietly(&self.conn).await;
            return Err(error);
        }
        self.commit().await
    }

    async fn close_session(&self, session_id: &str, end_time: f64) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute(
                "UPDATE sessions SET end_time = ?2, updated_at = CURRENT_TIMESTAMP
                 WHERE session_id = ?1 AND end_time IS NULL",
                params![session_id, end_time],
            )
            .await
            .map_err(|e| write_error("failed to close session", e))?;
        Ok(affected > 0)
    }

    async fn find_open_session(
        &self,
        device_id: &str,
        active_since: f64,
    ) -> Result<Option<OpenSession>, StorageError> {
        let mut rows = self
            .conn
            .query(
                "SELECT s.session_id, s.device_name, s.start_time, MAX(m.timestamp)
                 FROM sessions s
                 LEFT JOIN samples m ON m.session_id = s.session_id
                 WHERE s.device_id = ?1 AND s.end_time IS NULL
                 GROUP BY s.session_id
                 HAVING COALESCE(MAX(m.timestamp), s.start_time) >= ?2
                 ORDER BY s.start_time DESC
                 LIMIT 1",
                params![device_id, active_since],
            )
            .await
            .map_err(|e| query_error(format!("failed to find open session: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error(format!("failed to read open session row: {e}")))?
        else {
            return Ok(None);
        };

        Ok(Some(OpenSession {
            session_id: text_at(&row, 0)?,
            device_name: opt_text_at(&row, 1)?,
            start_time: f64_at(&row, 2)?,
            last_sample_at: opt_f64_at(&row, 3)?,
        }))
    }

    async fn insert_samples(
        &self,
        session_id: &str,
        samples: &[Sample],
    ) -> Result<usize, StorageError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        self.begin().await?;
        let result = async {
            for sample in samples {
                self.insert_sample(session_id, sample).await?;
            }
            Ok::<(), StorageError>(())
        }
        .await;
        if let Err(error) = result {
            rollback_quietly(&self.conn).await;
            return Err(error);
        }
        self.commit().await?;
        Ok(samples.len())
    }

    async fn upsert_aggregates(&self, aggregates: &[Aggregate]) -> Result<usize, StorageError> {
        if aggregates.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        self.begin().await?;
        let result = async {
            for aggregate in aggregates {
                self.upsert_aggregate(aggregate).await?;
            }
            Ok::<(), StorageError>(())
        }
        .await;
        if let Err(error) = result {
            rollback_quietly(&self.conn).await;
            return Err(error);
        }
        self.commit().await?;
        Ok(aggregates.len())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_id, device_id, device_name, start_time, end_time
                 FROM sessions
                 WHERE session_id = ?1
                 LIMIT 1",
                params![session_id],
            )
            .await
            .map_err(|e| query_error(format!("failed to get session: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error(format!("failed to read session row: {e}")))?
        else {
            return Ok(None);
        };

        Ok(Some(session_from_row(&row)?))
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionSummary>, StorageError> {
        let mut where_clauses = Vec::new();
        let mut bind_values: Vec<Value> = Vec::new();
        let mut param_index = 1u32;

        if let Some(ref device_id) = filter.device_id {
            where_clauses.push(format!("s.device_id = ?{param_index}"));
            bind_values.push(device_id.clone().into());
            param_index += 1;
        }
        if let Some(started_after) = filter.started_after {
            where_clauses.push(format!("s.start_time > ?{param_index}"));
            bind_values.push(started_after.into());
            param_index += 1;
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };
        let limit_sql = match filter.limit {
            Some(limit) => {
                bind_values.push(i64::from(limit).into());
                format!("LIMIT ?{param_index}")
            }
            None => String::new(),
        };

        let sql = format!(
            "SELECT s.session_id, s.device_id, s.device_name, s.start_time, s.end_time,
                    COUNT(m.id), AVG(m.heart_rate_bpm), MAX(m.total_distance_m),
                    COUNT(m.heart_rate_bpm)
             FROM sessions s
             LEFT JOIN samples m ON m.session_id = s.session_id
             {where_sql}
             GROUP BY s.session_id
             ORDER BY s.start_time DESC
             {limit_sql}"
        );
        let mut rows = self
            .conn
            .query(&sql, libsql::params::Params::Positional(bind_values))
            .await
            .map_err(|e| query_error(format!("failed to list sessions: {e}")))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error(format!("failed to read session list row: {e}")))?
        {
            summaries.push(SessionSummary {
                session: session_from_row(&row)?,
                sample_count: opt_i64_at(&row, 5)?.unwrap_or(0).max(0) as u64,
                avg_hr: opt_f64_at(&row, 6)?,
                total_distance: opt_f64_at(&row, 7)?,
                hr_sample_count: opt_i64_at(&row, 8)?.unwrap_or(0).max(0) as u64,
            });
        }
        Ok(summaries)
    }

    async fn session_stats(&self, session_id: &str) -> Result<SessionStats, StorageError> {
        if !self.session_exists(session_id).await? {
            return Err(StorageError::NotFound {
                session_id: session_id.to_string(),
            });
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp),
                        MIN(heart_rate_bpm), MAX(heart_rate_bpm), AVG(heart_rate_bpm),
                        AVG(speed_mps), MAX(speed_mps), AVG(cadence_spm),
                        MAX(total_distance_m)
                 FROM samples
                 WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| query_error(format!("failed to compute session stats: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| query_error(e.to_string()))?
            .ok_or_else(|| query_error("stats query returned no rows".to_owned()))?;

        Ok(SessionStats {
            sample_count: opt_i64_at(&row, 0)?.unwrap_or(0).max(0) as u64,
            first_sample_at: opt_f64_at(&row, 1)?,
            last_sample_at: opt_f64_at(&row, 2)?,
            min_hr: opt_i64_at(&row, 3)?.map(|v| v as i32),
            max_hr: opt_i64_at(&row, 4)?.map(|v| v as i32),
            avg_hr: opt_f64_at(&row, 5)?,
            avg_speed: opt_f64_at(&row, 6)?,
            max_speed: opt_f64_at(&row, 7)?,
            avg_cadence: opt_f64_at(&row, 8)?,
            total_distance: opt_f64_at(&row, 9)?,
        })
    }

    async fn session_samples(
        &self,
        session_id: &str,
        range: SampleRange,
    ) -> Result<Vec<Sample>, StorageError> {
        let mut where_clauses = vec!["session_id = ?1".to_owned()];
        let mut bind_values: Vec<Value> = vec![session_id.into()];
        let mut param_index = 2u32;

        if let Some(start) = range.start {
            where_clauses.push(format!("timestamp >= ?{param_index}"));
            bind_values.push(start.into());
            param_index += 1;
        }
        if let Some(end) = range.end {
            where_clauses.push(format!("timestamp <= ?{param_index}"));
            bind_values.push(end.into());
            param_index += 1;
        }
        let limit_sql = match range.limit {
            Some(limit) => {
                bind_values.push(i64::from(limit).into());
                format!("LIMIT ?{param_index}")
            }
            None => String::new(),
        };

        let sql = format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples WHERE {} ORDER BY timestamp ASC, id ASC {limit_sql}",
            where_clauses.join(" AND ")
        );
        let mut rows = self
            .conn
            .query(&sql, libsql::params::Params::Positional(bind_values))
            .await
            .map_err(|e| query_error(format!("failed to read samples: {e}")))?;

        let mut samples = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error(format!("failed to read sample row: {e}")))?
        {
            samples.push(sample_from_row(&row)?);
        }
        Ok(samples)
    }

    async fn last_sample_timestamp(&self, session_id: &str) -> Result<Option<f64>, StorageError> {
        let mut rows = self
            .conn
            .query(
                "SELECT MAX(timestamp) FROM samples WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| query_error(format!("failed to read last sample time: {e}")))?;
        match rows.next().await.map_err(|e| query_error(e.to_string()))? {
            Some(row) => opt_f64_at(&row, 0),
            None => Ok(None),
        }
    }

    async fn aggregates(
        &self,
        session_id: &str,
        interval_width: u32,
    ) -> Result<Vec<Aggregate>, StorageError> {
        let sql = format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregates
             WHERE session_id = ?1 AND interval_width = ?2
             ORDER BY interval_start ASC"
        );
        let mut rows = self
            .conn
            .query(&sql, params![session_id, i64::from(interval_width)])
            .await
            .map_err(|e| query_error(format!("failed to read aggregates: {e}")))?;

        let mut aggregates = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error(format!("failed to read aggregate row: {e}")))?
        {
            aggregates.push(Aggregate {
                session_id: text_at(&row, 0)?,
                interval_start: f64_at(&row, 1)?,
                interval_width: i64_at(&row, 2)? as u32,
                avg_hr: f64_at(&row, 3)?,
                min_hr: i64_at(&row, 4)? as i32,
                max_hr: i64_at(&row, 5)? as i32,
                avg_speed: opt_f64_at(&row, 6)?,
                max_speed: opt_f64_at(&row, 7)?,
                avg_cadence: opt_f64_at(&row, 8)?,
                max_distance: opt_f64_at(&row, 9)?,
                sample_count: i64_at(&row, 10)? as u32,
            });
        }
        Ok(aggregates)
    }
}

fn session_from_row(row: &libsql::Row) -> Result<SessionRecord, StorageError> {
    Ok(SessionRecord {
        session_id: text_at(row, 0)?,
        device_id: text_at(row, 1)?,
        device_name: opt_text_at(row, 2)?,
        start_time: f64_at(row, 3)?,
        end_time: opt_f64_at(row, 4)?,
    })
}

fn sample_from_row(row: &libsql::Row) -> Result<Sample, StorageError> {
    let rr_intervals = match opt_text_at(row, 2)? {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    Ok(Sample {
        timestamp: f64_at(row, 0)?,
        heart_rate_bpm: opt_i64_at(row, 1)?.map(|v| v as i32),
        rr_intervals,
        hrv_rmssd_ms: opt_f64_at(row, 3)?,
        speed_mps: opt_f64_at(row, 4)?,
        cadence_spm: opt_i64_at(row, 5)?.map(|v| v as i32),
        stride_length_cm: opt_i64_at(row, 6)?.map(|v| v as i32),
        total_distance_m: opt_f64_at(row, 7)?,
        battery_pct: opt_i64_at(row, 8)?.map(|v| v as i32),
        contact_status: ContactStatus::from_code(opt_i64_at(row, 9)?.unwrap_or(0)),
        is_running: opt_i64_at(row, 10)?.unwrap_or(0) != 0,
        raw_payload: opt_text_at(row, 11)?,
    })
}

// SQLite hands back INTEGER for whole-valued aggregates over REAL columns and
// vice versa, so numeric reads go through the dynamic value.

fn value_at(row: &libsql::Row, idx: i32) -> Result<Value, StorageError> {
    row.get_value(idx).map_err(|e| query_error(e.to_string()))
}

fn opt_f64_at(row: &libsql::Row, idx: i32) -> Result<Option<f64>, StorageError> {
    match value_at(row, idx)? {
        Value::Null => Ok(None),
        Value::Integer(v) => Ok(Some(v as f64)),
        Value::Real(v) => Ok(Some(v)),
        other => Err(query_error(format!(
            "column {idx}: expected a number, got {other:?}"
        ))),
    }
}

fn opt_i64_at(row: &libsql::Row, idx: i32) -> Result<Option<i64>, StorageError> {
    match value_at(row, idx)? {
        Value::Null => Ok(None),
        Value::Integer(v) => Ok(Some(v)),
        Value::Real(v) => Ok(Some(v.round() as i64)),
        other => Err(query_error(format!(
            "column {idx}: expected an integer, got {other:?}"
        ))),
    }
}

fn f64_at(row: &libsql::Row, idx: i32) -> Result<f64, StorageError> {
    opt_f64_at(row, idx)?.ok_or_else(|| query_error(format!("column {idx} is NULL")))
}

fn i64_at(row: &libsql::Row, idx: i32) -> Result<i64, StorageError> {
    opt_i64_at(row, idx)?.ok_or_else(|| query_error(format!("column {idx} is NULL")))
}

fn text_at(row: &libsql::Row, idx: i32) -> Result<String, StorageError> {
    row.get::<String>(idx).map_err(|e| query_error(e.to_string()))
}

fn opt_text_at(row: &libsql::Row, idx: i32) -> Result<Option<String>, StorageError> {
    row.get::<Option<String>>(idx)
        .map_err(|e| query_error(e.to_string()))
}
