//! Durable index of cached work bundles.
//!
//! Rows are keyed by the coordinator's work id so a bundle keeps the same
//! identity across restarts and re-downloads.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::warn;

use crate::domain::{WorkEntry, WorkId};
use crate::error::WorkerError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS works (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL,
        accessed_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS works_accessed_at ON works (accessed_at);";

/// Upper bound on bound parameters per statement.
const MAX_IDS_PER_STATEMENT: usize = 500;

pub trait WorkStore {
    /// Looks up one entry without refreshing its access time.
    fn get(&self, id: WorkId) -> Result<WorkEntry, WorkerError>;
    /// Registers (or re-registers) a bundle and returns its id.
    fn save(
        &self,
        id: WorkId,
        path: &Utf8Path,
        accessed_at: DateTime<Utc>,
    ) -> Result<WorkId, WorkerError>;
    /// Bulk refresh of access times. Unknown ids are ignored and timestamps
    /// never move backwards. Returns the number of rows touched.
    fn touch(&self, ids: &[WorkId], accessed_at: DateTime<Utc>) -> Result<usize, WorkerError>;
    /// Up to `count` entries, least recently used first.
    fn oldest(&self, count: usize) -> Result<Vec<WorkEntry>, WorkerError>;
    fn delete(&self, ids: &[WorkId]) -> Result<usize, WorkerError>;
    fn list(&self) -> Result<Vec<WorkEntry>, WorkerError>;
}

pub struct SqliteWorkStore {
    conn: Connection,
}

impl SqliteWorkStore {
    pub fn open(path: &Utf8Path) -> Result<Self, WorkerError> {
        let conn = Connection::open(path.as_std_path())
            .map_err(|err| WorkerError::Storage(format!("open {path}: {err}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, WorkerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, WorkerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Releases the connection. Consumes the store, so it can only happen once.
    pub fn close(self) -> Result<(), WorkerError> {
        self.conn.close().map_err(|(_, err)| WorkerError::from(err))
    }

    /// Runs an entry query, dropping rows that no longer parse. Returns the
    /// readable entries and the number of rows dropped.
    fn query_entries(
        &self,
        sql: &str,
        limit: Option<i64>,
    ) -> Result<(Vec<WorkEntry>, usize), WorkerError> {
        let mut entries = Vec::new();
        let mut unreadable = Vec::new();
        {
            let mut stmt = self.conn.prepare(sql)?;
            let mut rows = match limit {
                Some(limit) => stmt.query(params![limit])?,
                None => stmt.query([])?,
            };
            while let Some(row) = rows.next()? {
                match entry_from_row(row) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        let id: i64 = row.get(0)?;
                        warn!(id, error = %err, "dropping unreadable work cache row");
                        unreadable.push(id);
                    }
                }
            }
        }
        for id in &unreadable {
            self.conn
                .execute("DELETE FROM works WHERE id = ?1", params![id])?;
        }
        Ok((entries, unreadable.len()))
    }
}

impl WorkStore for SqliteWorkStore {
    fn get(&self, id: WorkId) -> Result<WorkEntry, WorkerError> {
        let entry = self
            .conn
            .query_row(
                "SELECT id, path, accessed_at FROM works WHERE id = ?1",
                params![to_sql_id(id)?],
                |row| Ok(entry_from_row(row)),
            )
            .optional()?;
        match entry {
            Some(entry) => entry,
            None => Err(WorkerError::WorkNotFound(id.get())),
        }
    }

    fn save(
        &self,
        id: WorkId,
        path: &Utf8Path,
        accessed_at: DateTime<Utc>,
    ) -> Result<WorkId, WorkerError> {
        self.conn.execute(
            "INSERT INTO works (id, path, accessed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                accessed_at = MAX(works.accessed_at, excluded.accessed_at)",
            params![to_sql_id(id)?, path.as_str(), to_sql_time(accessed_at)],
        )?;
        Ok(id)
    }

    fn touch(&self, ids: &[WorkId], accessed_at: DateTime<Utc>) -> Result<usize, WorkerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let stamp = to_sql_time(accessed_at);
        let tx = self.conn.unchecked_transaction()?;
        let mut touched = 0usize;
        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let sql = format!(
                "UPDATE works SET accessed_at = MAX(accessed_at, ?1) WHERE id IN ({})",
                placeholders(chunk.len(), 2)
            );
            let mut values = vec![rusqlite::types::Value::from(stamp.clone())];
            for id in chunk {
                values.push(rusqlite::types::Value::from(to_sql_id(*id)?));
            }
            touched += tx.execute(&sql, params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(touched)
    }

    fn oldest(&self, count: usize) -> Result<Vec<WorkEntry>, WorkerError> {
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        // Dropped rows free their LIMIT slots, so query again until the page
        // is full or nothing unreadable remains in it.
        loop {
            let (entries, dropped) = self.query_entries(
                "SELECT id, path, accessed_at FROM works ORDER BY accessed_at ASC, id ASC LIMIT ?1",
                Some(limit),
            )?;
            if dropped == 0 || entries.len() >= count {
                return Ok(entries);
            }
        }
    }

    fn delete(&self, ids: &[WorkId]) -> Result<usize, WorkerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut deleted = 0usize;
        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let sql = format!(
                "DELETE FROM works WHERE id IN ({})",
                placeholders(chunk.len(), 1)
            );
            let values = chunk
                .iter()
                .map(|id| to_sql_id(*id))
                .collect::<Result<Vec<_>, _>>()?;
            deleted += tx.execute(&sql, params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn list(&self) -> Result<Vec<WorkEntry>, WorkerError> {
        let (entries, _) = self.query_entries(
            "SELECT id, path, accessed_at FROM works ORDER BY accessed_at ASC, id ASC",
            None,
        )?;
        Ok(entries)
    }
}

/// `?start, ?start+1, ...` for `count` parameters.
fn placeholders(count: usize, start: usize) -> String {
    (start..start + count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_sql_id(id: WorkId) -> Result<i64, WorkerError> {
    i64::try_from(id.get())
        .map_err(|_| WorkerError::Storage(format!("work id {id} exceeds storage range")))
}

/// Fixed-width RFC 3339 in UTC, so text order matches time order.
fn to_sql_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<WorkEntry, WorkerError> {
    let id: i64 = row.get(0)?;
    let path: String = row.get(1)?;
    let stamp: String = row.get(2)?;
    let id = u64::try_from(id)
        .map_err(|_| WorkerError::Storage(format!("negative work id in cache: {id}")))?;
    let accessed_at = DateTime::parse_from_rfc3339(&stamp)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| WorkerError::Storage(format!("invalid timestamp for work {id}: {err}")))?;
    Ok(WorkEntry {
        id: WorkId::new(id),
        path: Utf8PathBuf::from(path),
        accessed_at,
    })
}
