//! Job persistence.
//!
//! [`JobDb`] is the contract the cache persists through. Calls may arrive
//! concurrently from the periodic sweep and from write-through callers, so
//! implementations do their own locking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::types::JobRecord;

pub trait JobDb: Send + Sync {
    fn get_all(&self) -> Result<Vec<JobRecord>>;

    /// Fails with [`SchedulerError::JobNotFound`] when absent.
    fn get(&self, id: &str) -> Result<JobRecord>;

    /// Fails with [`SchedulerError::JobNotFound`] when absent.
    fn delete(&self, id: &str) -> Result<()>;

    /// Insert or replace.
    fn save(&self, job: &JobRecord) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Initialise the scheduler schema in `conn`.
///
/// One row per job; the full [`JobRecord`] is stored as JSON so new fields do
/// not need a migration.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            record      TEXT    NOT NULL,   -- JSON-encoded JobRecord
            updated_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// SQLite-backed store.
pub struct SqliteJobDb {
    conn: Mutex<Option<Connection>>,
}

impl SqliteJobDb {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open (or create) the database file, creating its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "job store opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobDb for SqliteJobDb {
    fn get_all(&self) -> Result<Vec<JobRecord>> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(SchedulerError::StoreClosed)?;
        let mut stmt = conn.prepare("SELECT record FROM jobs ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let jobs = rows
            .iter()
            .map(|json| serde_json::from_str(json))
            .collect::<std::result::Result<Vec<JobRecord>, _>>()?;
        Ok(jobs)
    }

    fn get(&self, id: &str) -> Result<JobRecord> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(SchedulerError::StoreClosed)?;
        let json: Option<String> = conn
            .query_row("SELECT record FROM jobs WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let json = json.ok_or_else(|| SchedulerError::not_found(id))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(SchedulerError::StoreClosed)?;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::not_found(id));
        }
        debug!(job_id = %id, "job deleted from store");
        Ok(())
    }

    fn save(&self, job: &JobRecord) -> Result<()> {
        let json = serde_json::to_string(job)?;
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(SchedulerError::StoreClosed)?;
        conn.execute(
            "INSERT INTO jobs (id, name, record, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                record = excluded.record,
                updated_at = excluded.updated_at",
            rusqlite::params![job.id, job.name, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(conn) = self.conn().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| SchedulerError::Database(e))?;
        info!("job store closed");
        Ok(())
    }
}

/// Process-local store, for tests and `backend = "memory"`.
#[derive(Debug, Default)]
pub struct MemoryJobDb {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryJobDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}

impl JobDb for MemoryJobDb {
    fn get_all(&self) -> Result<Vec<JobRecord>> {
        Ok(self.jobs().values().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<JobRecord> {
        self.jobs()
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::not_found(id))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.jobs()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::not_found(id))
    }

    fn save(&self, job: &JobRecord) -> Result<()> {
        self.jobs().insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
