//! Store implementation
//!
//! One `Store` is opened by the scheduler per run directory and holds an
//! exclusive advisory lock for the lifetime of the process. All mutation
//! goes through [`Store::batch`], which wraps a SQLite transaction so that
//! every write belonging to one main-loop tick reaches disk atomically.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::types::{
    BroadcastChange, BroadcastEventRow, PoolRow, TaskEventRow, TaskJobRow, TaskStateRow, XtriggerRow,
};

/// Typed store failures that callers may need to distinguish
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another scheduler already holds the run directory
    #[error("workflow database is locked by another scheduler: {0}")]
    Locked(PathBuf),
    /// Underlying SQLite failure; fatal for the scheduler
    #[error("workflow database error: {0}")]
    Db(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_states(
    name TEXT NOT NULL,
    cycle TEXT NOT NULL,
    submit_num INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    is_held INTEGER NOT NULL DEFAULT 0,
    time_created TEXT NOT NULL,
    time_updated TEXT NOT NULL,
    PRIMARY KEY(name, cycle)
);
CREATE TABLE IF NOT EXISTS task_jobs(
    cycle TEXT NOT NULL,
    name TEXT NOT NULL,
    submit_num INTEGER NOT NULL,
    try_num INTEGER NOT NULL DEFAULT 1,
    is_manual_submit INTEGER NOT NULL DEFAULT 0,
    submit_status INTEGER,
    time_submit TEXT,
    time_run TEXT,
    time_run_exit TEXT,
    run_signal TEXT,
    run_status INTEGER,
    platform_name TEXT NOT NULL DEFAULT 'localhost',
    job_runner_name TEXT NOT NULL DEFAULT 'background',
    job_id TEXT,
    PRIMARY KEY(cycle, name, submit_num)
);
CREATE TABLE IF NOT EXISTS task_outputs(
    cycle TEXT NOT NULL,
    name TEXT NOT NULL,
    outputs TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY(cycle, name)
);
CREATE TABLE IF NOT EXISTS task_events(
    name TEXT NOT NULL,
    cycle TEXT NOT NULL,
    time TEXT NOT NULL,
    submit_num INTEGER NOT NULL DEFAULT 0,
    event TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS broadcast_events(
    time TEXT NOT NULL,
    change TEXT NOT NULL,
    point TEXT NOT NULL,
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS workflow_params(
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_pool(
    cycle TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    is_held INTEGER NOT NULL DEFAULT 0,
    satisfied TEXT NOT NULL DEFAULT '{}',
    outputs TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY(cycle, name)
);
CREATE TABLE IF NOT EXISTS xtriggers(
    signature TEXT PRIMARY KEY,
    results TEXT NOT NULL DEFAULT '{}'
);
";

/// The workflow database
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
    /// Held for the process lifetime; dropping releases the lock
    _lock: fs::File,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and take the
    /// single-writer lock. Fails fast if another scheduler holds it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let lock_path = path.with_extension("lock");
        let lock = fs::File::create(&lock_path).context("Failed to create database lock file")?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path).into());
        }

        let conn = Connection::open(&path).context("Failed to open workflow database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA).context("Failed to create schema")?;

        debug!(path = %path.display(), "Opened workflow database");
        Ok(Self { conn, path, _lock: lock })
    }

    /// Whether a database already exists at `path` (restart detection)
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a tick batch; all writes commit together on [`Batch::commit`]
    pub fn batch(&mut self) -> Result<Batch<'_>> {
        let txn = self.conn.transaction().map_err(StoreError::Db)?;
        Ok(Batch { txn })
    }

    /// Copy the database to a read-only location (the public `log/db`)
    pub fn copy_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("Failed to create copy directory")?;
        }
        let mut dst = Connection::open(dest).context("Failed to open database copy")?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dst).map_err(StoreError::Db)?;
        backup
            .run_to_completion(256, std::time::Duration::from_millis(5), None)
            .map_err(StoreError::Db)?;
        debug!(dest = %dest.display(), "Copied workflow database");
        Ok(())
    }

    // === restart loading ===

    /// Load the checkpointed task pool
    pub fn load_task_pool(&self) -> Result<Vec<PoolRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT cycle, name, status, is_held, satisfied, outputs FROM task_pool")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(PoolRow {
                    cycle: r.get(0)?,
                    name: r.get(1)?,
                    status: r.get(2)?,
                    is_held: r.get::<_, i64>(3)? != 0,
                    satisfied: r.get(4)?,
                    outputs: r.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        info!(count = rows.len(), "Loaded task pool checkpoint");
        Ok(rows)
    }

    /// Load all recorded task states
    pub fn load_task_states(&self) -> Result<Vec<TaskStateRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, cycle, submit_num, status, is_held, time_created, time_updated FROM task_states",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(TaskStateRow {
                    name: r.get(0)?,
                    cycle: r.get(1)?,
                    submit_num: r.get(2)?,
                    status: r.get(3)?,
                    is_held: r.get::<_, i64>(4)? != 0,
                    time_created: r.get(5)?,
                    time_updated: r.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Load the latest job row per (cycle, name); used to reconcile
    /// outstanding jobs on restart
    pub fn load_latest_task_jobs(&self) -> Result<Vec<TaskJobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle, name, submit_num, try_num, is_manual_submit, submit_status,
                    time_submit, time_run, time_run_exit, run_signal, run_status,
                    platform_name, job_runner_name, job_id
             FROM task_jobs t
             WHERE submit_num = (
                 SELECT MAX(submit_num) FROM task_jobs WHERE cycle = t.cycle AND name = t.name
             )",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(TaskJobRow {
                    cycle: r.get(0)?,
                    name: r.get(1)?,
                    submit_num: r.get(2)?,
                    try_num: r.get(3)?,
                    is_manual_submit: r.get::<_, i64>(4)? != 0,
                    submit_status: r.get(5)?,
                    time_submit: r.get(6)?,
                    time_run: r.get(7)?,
                    time_run_exit: r.get(8)?,
                    run_signal: r.get(9)?,
                    run_status: r.get(10)?,
                    platform_name: r.get(11)?,
                    job_runner_name: r.get(12)?,
                    job_id: r.get(13)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Load all job rows for one instance, oldest first
    pub fn load_task_jobs(&self, cycle: &str, name: &str) -> Result<Vec<TaskJobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle, name, submit_num, try_num, is_manual_submit, submit_status,
                    time_submit, time_run, time_run_exit, run_signal, run_status,
                    platform_name, job_runner_name, job_id
             FROM task_jobs WHERE cycle = ?1 AND name = ?2 ORDER BY submit_num",
        )?;
        let rows = stmt
            .query_map(params![cycle, name], |r| {
                Ok(TaskJobRow {
                    cycle: r.get(0)?,
                    name: r.get(1)?,
                    submit_num: r.get(2)?,
                    try_num: r.get(3)?,
                    is_manual_submit: r.get::<_, i64>(4)? != 0,
                    submit_status: r.get(5)?,
                    time_submit: r.get(6)?,
                    time_run: r.get(7)?,
                    time_run_exit: r.get(8)?,
                    run_signal: r.get(9)?,
                    run_status: r.get(10)?,
                    platform_name: r.get(11)?,
                    job_runner_name: r.get(12)?,
                    job_id: r.get(13)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Load the full broadcast journal in insertion order
    pub fn load_broadcast_events(&self) -> Result<Vec<BroadcastEventRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT time, change, point, namespace, key, value FROM broadcast_events ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |r| {
                let change: String = r.get(1)?;
                Ok(BroadcastEventRow {
                    time: r.get(0)?,
                    change: BroadcastChange::from_marker(&change).unwrap_or(BroadcastChange::Set),
                    point: r.get(2)?,
                    namespace: r.get(3)?,
                    key: r.get(4)?,
                    value: r.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Load workflow parameters
    pub fn load_workflow_params(&self) -> Result<HashMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM workflow_params")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    /// Load satisfied xtrigger signatures
    pub fn load_xtriggers(&self) -> Result<Vec<XtriggerRow>> {
        let mut stmt = self.conn.prepare("SELECT signature, results FROM xtriggers")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(XtriggerRow {
                    signature: r.get(0)?,
                    results: r.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All recorded output sets as (cycle, name, outputs JSON); used to
    /// replay downstream spawning on restart
    pub fn load_all_task_outputs(&self) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self.conn.prepare("SELECT cycle, name, outputs FROM task_outputs")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Completed outputs for one instance (JSON list), if recorded
    pub fn load_task_outputs(&self, cycle: &str, name: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT outputs FROM task_outputs WHERE cycle = ?1 AND name = ?2",
                params![cycle, name],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::Db)?;
        Ok(row)
    }

    /// Highest submit number recorded for an instance (0 if none)
    pub fn max_submit_num(&self, cycle: &str, name: &str) -> Result<u32> {
        let n: Option<u32> = self
            .conn
            .query_row(
                "SELECT MAX(submit_num) FROM task_jobs WHERE cycle = ?1 AND name = ?2",
                params![cycle, name],
                |r| r.get(0),
            )
            .optional()
            .map_err(StoreError::Db)?
            .flatten();
        Ok(n.unwrap_or(0))
    }

    /// Task events for one instance, oldest first (CLI `show`)
    pub fn load_task_events(&self, cycle: &str, name: &str) -> Result<Vec<TaskEventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, cycle, time, submit_num, event, message
             FROM task_events WHERE cycle = ?1 AND name = ?2 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![cycle, name], |r| {
                Ok(TaskEventRow {
                    name: r.get(0)?,
                    cycle: r.get(1)?,
                    time: r.get(2)?,
                    submit_num: r.get(3)?,
                    event: r.get(4)?,
                    message: r.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Latest recorded state of one instance, if any
    pub fn get_task_state(&self, cycle: &str, name: &str) -> Result<Option<String>> {
        let status = self
            .conn
            .query_row(
                "SELECT status FROM task_states WHERE cycle = ?1 AND name = ?2",
                params![cycle, name],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::Db)?;
        Ok(status)
    }

    /// Read one task's recorded state from a database copy without taking
    /// the writer lock (peer-workflow polls, CLI readers)
    pub fn read_task_state(path: impl AsRef<Path>, name: &str, cycle: &str) -> Result<Option<String>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open database copy {}", path.display()))?;
        let status = conn
            .query_row(
                "SELECT status FROM task_states WHERE name = ?1 AND cycle = ?2",
                params![name, cycle],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::Db)?;
        Ok(status)
    }

    /// Count of task_states rows (used by tests and `dump`)
    pub fn count_task_states(&self) -> Result<u32> {
        let n: u32 = self
            .conn
            .query_row("SELECT COUNT(*) FROM task_states", [], |r| r.get(0))
            .map_err(StoreError::Db)?;
        Ok(n)
    }
}

/// One tick's worth of writes, committed atomically
pub struct Batch<'a> {
    txn: rusqlite::Transaction<'a>,
}

impl Batch<'_> {
    /// Upsert the latest state row for an instance
    pub fn set_task_state(&self, row: &TaskStateRow) -> Result<()> {
        self.txn
            .execute(
                "INSERT INTO task_states(name, cycle, submit_num, status, is_held, time_created, time_updated)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name, cycle) DO UPDATE SET
                     submit_num = excluded.submit_num,
                     status = excluded.status,
                     is_held = excluded.is_held,
                     time_updated = excluded.time_updated",
                params![
                    row.name,
                    row.cycle,
                    row.submit_num,
                    row.status,
                    row.is_held as i64,
                    row.time_created,
                    row.time_updated,
                ],
            )
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Upsert a job row; the submitted job id is never overwritten with NULL
    pub fn upsert_task_job(&self, row: &TaskJobRow) -> Result<()> {
        self.txn
            .execute(
                "INSERT INTO task_jobs(cycle, name, submit_num, try_num, is_manual_submit, submit_status,
                                       time_submit, time_run, time_run_exit, run_signal, run_status,
                                       platform_name, job_runner_name, job_id)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(cycle, name, submit_num) DO UPDATE SET
                     try_num = excluded.try_num,
                     submit_status = excluded.submit_status,
                     time_submit = COALESCE(excluded.time_submit, task_jobs.time_submit),
                     time_run = COALESCE(excluded.time_run, task_jobs.time_run),
                     time_run_exit = COALESCE(excluded.time_run_exit, task_jobs.time_run_exit),
                     run_signal = COALESCE(excluded.run_signal, task_jobs.run_signal),
                     run_status = COALESCE(excluded.run_status, task_jobs.run_status),
                     platform_name = excluded.platform_name,
                     job_runner_name = excluded.job_runner_name,
                     job_id = COALESCE(excluded.job_id, task_jobs.job_id)",
                params![
                    row.cycle,
                    row.name,
                    row.submit_num,
                    row.try_num,
                    row.is_manual_submit as i64,
                    row.submit_status,
                    row.time_submit,
                    row.time_run,
                    row.time_run_exit,
                    row.run_signal,
                    row.run_status,
                    row.platform_name,
                    row.job_runner_name,
                    row.job_id,
                ],
            )
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Replace the completed-output list for an instance
    pub fn set_task_outputs(&self, cycle: &str, name: &str, outputs_json: &str) -> Result<()> {
        self.txn
            .execute(
                "INSERT INTO task_outputs(cycle, name, outputs) VALUES(?1, ?2, ?3)
                 ON CONFLICT(cycle, name) DO UPDATE SET outputs = excluded.outputs",
                params![cycle, name, outputs_json],
            )
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Append a task event
    pub fn insert_task_event(&self, row: &TaskEventRow) -> Result<()> {
        self.txn
            .execute(
                "INSERT INTO task_events(name, cycle, time, submit_num, event, message)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.name, row.cycle, row.time, row.submit_num, row.event, row.message],
            )
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Append a broadcast journal entry
    pub fn insert_broadcast_event(&self, row: &BroadcastEventRow) -> Result<()> {
        self.txn
            .execute(
                "INSERT INTO broadcast_events(time, change, point, namespace, key, value)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.time, row.change.marker(), row.point, row.namespace, row.key, row.value],
            )
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Upsert a workflow parameter
    pub fn set_workflow_param(&self, key: &str, value: &str) -> Result<()> {
        self.txn
            .execute(
                "INSERT INTO workflow_params(key, value) VALUES(?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Delete a workflow parameter
    pub fn delete_workflow_param(&self, key: &str) -> Result<()> {
        self.txn
            .execute("DELETE FROM workflow_params WHERE key = ?1", params![key])
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Rewrite the task pool checkpoint with the given rows
    pub fn replace_task_pool(&self, rows: &[PoolRow]) -> Result<()> {
        self.txn.execute("DELETE FROM task_pool", []).map_err(StoreError::Db)?;
        for row in rows {
            self.txn
                .execute(
                    "INSERT INTO task_pool(cycle, name, status, is_held, satisfied, outputs)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                    params![row.cycle, row.name, row.status, row.is_held as i64, row.satisfied, row.outputs],
                )
                .map_err(StoreError::Db)?;
        }
        Ok(())
    }

    /// Record a satisfied xtrigger signature
    pub fn upsert_xtrigger(&self, row: &XtriggerRow) -> Result<()> {
        self.txn
            .execute(
                "INSERT INTO xtriggers(signature, results) VALUES(?1, ?2)
                 ON CONFLICT(signature) DO UPDATE SET results = excluded.results",
                params![row.signature, row.results],
            )
            .map_err(StoreError::Db)?;
        Ok(())
    }

    /// Commit the batch
    pub fn commit(self) -> Result<()> {
        self.txn.commit().map_err(StoreError::Db)?;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Fold the WAL back into the main file so the on-disk db is complete
        if let Err(e) = self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_iso;
    use tempfile::TempDir;

    fn state_row(name: &str, cycle: &str, status: &str) -> TaskStateRow {
        TaskStateRow {
            name: name.to_string(),
            cycle: cycle.to_string(),
            submit_num: 1,
            status: status.to_string(),
            is_held: false,
            time_created: now_iso(),
            time_updated: now_iso(),
        }
    }

    #[test]
    fn test_open_creates_schema() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("db")).unwrap();
        assert_eq!(store.count_task_states().unwrap(), 0);
    }

    #[test]
    fn test_second_open_is_locked() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db");
        let _store = Store::open(&path).unwrap();
        let err = Store::open(&path).unwrap_err();
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_task_state_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path().join("db")).unwrap();

        let batch = store.batch().unwrap();
        batch.set_task_state(&state_row("a", "1", "waiting")).unwrap();
        batch.commit().unwrap();

        let batch = store.batch().unwrap();
        batch.set_task_state(&state_row("a", "1", "running")).unwrap();
        batch.commit().unwrap();

        let states = store.load_task_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, "running");
    }

    #[test]
    fn test_job_id_never_lost() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path().join("db")).unwrap();

        let mut job = TaskJobRow {
            cycle: "1".to_string(),
            name: "a".to_string(),
            submit_num: 1,
            try_num: 1,
            platform_name: "localhost".to_string(),
            job_runner_name: "background".to_string(),
            job_id: Some("12345".to_string()),
            ..Default::default()
        };

        let batch = store.batch().unwrap();
        batch.upsert_task_job(&job).unwrap();
        batch.commit().unwrap();

        // Later update carries no job id; the stored one must survive
        job.job_id = None;
        job.run_status = Some(0);
        let batch = store.batch().unwrap();
        batch.upsert_task_job(&job).unwrap();
        batch.commit().unwrap();

        let jobs = store.load_latest_task_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id.as_deref(), Some("12345"));
        assert_eq!(jobs[0].run_status, Some(0));
    }

    #[test]
    fn test_task_pool_rewrite_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path().join("db")).unwrap();

        let rows = vec![
            PoolRow {
                cycle: "1".to_string(),
                name: "a".to_string(),
                status: "succeeded".to_string(),
                is_held: false,
                satisfied: "{}".to_string(),
                outputs: r#"["succeeded"]"#.to_string(),
            },
            PoolRow {
                cycle: "2".to_string(),
                name: "a".to_string(),
                status: "waiting".to_string(),
                is_held: true,
                satisfied: r#"{"a.1:succeeded":true}"#.to_string(),
                outputs: "[]".to_string(),
            },
        ];

        let batch = store.batch().unwrap();
        batch.replace_task_pool(&rows).unwrap();
        batch.commit().unwrap();

        let mut loaded = store.load_task_pool().unwrap();
        loaded.sort_by(|a, b| a.cycle.cmp(&b.cycle));
        assert_eq!(loaded, rows);
    }

    #[test]
    fn test_broadcast_journal_order() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path().join("db")).unwrap();

        let batch = store.batch().unwrap();
        for (change, value) in [(BroadcastChange::Set, "\"world\""), (BroadcastChange::Cancel, "")] {
            batch
                .insert_broadcast_event(&BroadcastEventRow {
                    time: now_iso(),
                    change,
                    point: "*".to_string(),
                    namespace: "t".to_string(),
                    key: "environment.HELLO".to_string(),
                    value: value.to_string(),
                })
                .unwrap();
        }
        batch.commit().unwrap();

        let events = store.load_broadcast_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].change, BroadcastChange::Set);
        assert_eq!(events[1].change, BroadcastChange::Cancel);
    }

    #[test]
    fn test_workflow_params() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path().join("db")).unwrap();

        let batch = store.batch().unwrap();
        batch.set_workflow_param("stop_mode", "clean").unwrap();
        batch.set_workflow_param("stop_mode", "now").unwrap();
        batch.commit().unwrap();

        let params = store.load_workflow_params().unwrap();
        assert_eq!(params.get("stop_mode").map(String::as_str), Some("now"));

        let batch = store.batch().unwrap();
        batch.delete_workflow_param("stop_mode").unwrap();
        batch.commit().unwrap();
        assert!(store.load_workflow_params().unwrap().is_empty());
    }

    #[test]
    fn test_copy_to_is_readable() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path().join("db")).unwrap();

        let batch = store.batch().unwrap();
        batch.set_task_state(&state_row("a", "1", "succeeded")).unwrap();
        batch.commit().unwrap();

        let copy = temp.path().join("log").join("db");
        store.copy_to(&copy).unwrap();

        let read = Connection::open(&copy).unwrap();
        let n: u32 = read
            .query_row("SELECT COUNT(*) FROM task_states", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_max_submit_num() {
        let temp = TempDir::new().unwrap();
        let mut store = Store::open(temp.path().join("db")).unwrap();
        assert_eq!(store.max_submit_num("1", "a").unwrap(), 0);

        let batch = store.batch().unwrap();
        for submit_num in 1..=3 {
            batch
                .upsert_task_job(&TaskJobRow {
                    cycle: "1".to_string(),
                    name: "a".to_string(),
                    submit_num,
                    try_num: submit_num,
                    platform_name: "localhost".to_string(),
                    job_runner_name: "background".to_string(),
                    ..Default::default()
                })
                .unwrap();
        }
        batch.commit().unwrap();
        assert_eq!(store.max_submit_num("1", "a").unwrap(), 3);
    }
}
