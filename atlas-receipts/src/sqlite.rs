//! SQLite-backed audit store.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};

use crate::{AuditError, AuditFilter, AuditPage, AuditRecord, AuditStore, PageRequest, StatsWindow};

const SCHEMA: &str = "PRAGMA journal_mode=WAL;PRAGMA synchronous=FULL;CREATE TABLE IF NOT EXISTS \
     audit_records (request_id TEXT PRIMARY KEY,actor_id TEXT NOT NULL,tool_id TEXT NOT \
     NULL,params TEXT NOT NULL,success INTEGER NOT NULL,reason_code TEXT,error_message \
     TEXT,duration_ms INTEGER NOT NULL,timestamp_ms INTEGER NOT NULL,session_id TEXT);CREATE \
     INDEX IF NOT EXISTS idx_audit_actor_time ON audit_records(actor_id, timestamp_ms);CREATE \
     INDEX IF NOT EXISTS idx_audit_time ON audit_records(timestamp_ms);";

const COLUMNS: &str = "request_id, actor_id, tool_id, params, success, reason_code, \
     error_message, duration_ms, timestamp_ms, session_id";

const ACTOR_FILTER: &str = "actor_id = ?1 AND (?2 IS NULL OR tool_id = ?2) AND (?3 IS NULL OR \
     success = ?3) AND (?4 IS NULL OR timestamp_ms >= ?4) AND (?5 IS NULL OR timestamp_ms <= ?5)";

pub struct SqliteAuditStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| AuditError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(storage)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::init(Connection::open_in_memory().map_err(storage)?)
    }

    fn init(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, AuditError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AuditError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let conn = connection
                .lock()
                .map_err(|_| AuditError::Storage("audit store lock poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| AuditError::Storage(e.to_string()))?
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let record = record.clone();
        let params_json =
            serde_json::to_string(&record.params).map_err(|e| AuditError::Parse(e.to_string()))?;
        self.run(move |conn| {
            conn.execute(
                &format!("INSERT INTO audit_records ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    record.request_id,
                    record.actor_id,
                    record.tool_id,
                    params_json,
                    record.success,
                    record.reason_code,
                    record.error_message,
                    i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
                    record.timestamp.timestamp_millis(),
                    record.session_id,
                ],
            )
            .map_err(|err| match err {
                rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                    AuditError::Duplicate(record.request_id.clone())
                }
                other => storage(other),
            })?;
            Ok(())
        })
        .await
    }

    async fn find_by_request_id(&self, request_id: &str) -> Result<Option<AuditRecord>, AuditError> {
        let request_id = request_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {COLUMNS} FROM audit_records WHERE request_id = ?1"))
                .map_err(storage)?;
            let mut rows = stmt.query_map(params![request_id], RawRecord::from_row).map_err(storage)?;
            match rows.next() {
                Some(row) => Ok(Some(row.map_err(storage)?.into_record()?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn find_by_actor(
        &self,
        actor_id: &str,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<AuditPage, AuditError> {
        let actor_id = actor_id.to_string();
        let filter = filter.clone();
        let page = page.normalized();
        self.run(move |conn| {
            let tool_id = filter.tool_id.as_deref();
            let start = filter.start.map(|t| t.timestamp_millis());
            let end = filter.end.map(|t| t.timestamp_millis());

            let total: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM audit_records WHERE {ACTOR_FILTER}"),
                    params![actor_id, tool_id, filter.success, start, end],
                    |row| row.get(0),
                )
                .map_err(storage)?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM audit_records WHERE {ACTOR_FILTER} \
                     ORDER BY timestamp_ms DESC, rowid DESC LIMIT ?6 OFFSET ?7"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(
                    params![
                        actor_id,
                        tool_id,
                        filter.success,
                        start,
                        end,
                        i64::from(page.limit),
                        i64::try_from(page.offset()).unwrap_or(i64::MAX),
                    ],
                    RawRecord::from_row,
                )
                .map_err(storage)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(storage)?.into_record()?);
            }
            Ok(AuditPage {
                records,
                total: u64::try_from(total).unwrap_or(0),
                page: page.page,
                limit: page.limit,
            })
        })
        .await
    }

    async fn counts(&self, window: &StatsWindow) -> Result<(u64, u64), AuditError> {
        let start = window.start.map(|t| t.timestamp_millis());
        let end = window.end.map(|t| t.timestamp_millis());
        self.run(move |conn| {
            let (total, ok): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM audit_records \
                     WHERE (?1 IS NULL OR timestamp_ms >= ?1) AND (?2 IS NULL OR timestamp_ms <= ?2)",
                    params![start, end],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(storage)?;
            Ok((
                u64::try_from(total).unwrap_or(0),
                u64::try_from(ok).unwrap_or(0),
            ))
        })
        .await
    }
}

struct RawRecord {
    request_id: String,
    actor_id: String,
    tool_id: String,
    params: String,
    success: bool,
    reason_code: Option<String>,
    error_message: Option<String>,
    duration_ms: i64,
    timestamp_ms: i64,
    session_id: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            request_id: row.get(0)?,
            actor_id: row.get(1)?,
            tool_id: row.get(2)?,
            params: row.get(3)?,
            success: row.get(4)?,
            reason_code: row.get(5)?,
            error_message: row.get(6)?,
            duration_ms: row.get(7)?,
            timestamp_ms: row.get(8)?,
            session_id: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<AuditRecord, AuditError> {
        let params =
            serde_json::from_str(&self.params).map_err(|e| AuditError::Parse(e.to_string()))?;
        Ok(AuditRecord {
            request_id: self.request_id,
            actor_id: self.actor_id,
            tool_id: self.tool_id,
            params,
            success: self.success,
            reason_code: self.reason_code,
            error_message: self.error_message,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or(0),
            timestamp: from_millis(self.timestamp_ms)?,
            session_id: self.session_id,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, AuditError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AuditError::Parse(format!("timestamp out of range: {ms}")))
}

fn storage(err: rusqlite::Error) -> AuditError {
    AuditError::Storage(err.to_string())
}
