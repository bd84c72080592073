//! SQLite-backed task store.
//!
//! Every state transition is a single conditional `UPDATE ... WHERE id = ?
//! AND version = ?`; the affected-row count decides who won. That is what keeps
//! several processes polling the same database file safe without any other
//! coordination.
//!
//! Timestamps are stored as Unix milliseconds.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, params};
use tracing::debug;

use crate::domain::{
    NewHistory, NewTask, Outcome, Task, TaskHistory, TaskId, TaskStatus, TaskType,
};
use crate::ports::{StoreError, TaskStore, TaskWriter};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS spindle_task (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    custom_id       TEXT    NOT NULL DEFAULT '',
    task_type       INTEGER NOT NULL,
    status          INTEGER NOT NULL DEFAULT 0,
    content         BLOB    NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    next_retry_time INTEGER NOT NULL,
    last_error      TEXT    NOT NULL DEFAULT '',
    version         INTEGER NOT NULL DEFAULT 0,
    create_time     INTEGER NOT NULL,
    update_time     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spindle_task_custom_id
    ON spindle_task (custom_id);
CREATE UNIQUE INDEX IF NOT EXISTS uq_spindle_task_type_custom_id
    ON spindle_task (task_type, custom_id) WHERE custom_id <> '';
CREATE INDEX IF NOT EXISTS idx_spindle_task_type_status_time
    ON spindle_task (task_type, status, next_retry_time);
CREATE INDEX IF NOT EXISTS idx_spindle_task_status_update_time
    ON spindle_task (status, update_time);

CREATE TABLE IF NOT EXISTS spindle_task_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL,
    round       INTEGER NOT NULL,
    succeeded   INTEGER NOT NULL,
    result      TEXT    NOT NULL DEFAULT '',
    start_time  INTEGER NOT NULL,
    end_time    INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spindle_task_history_task_id
    ON spindle_task_history (task_id);
";

const TASK_COLUMNS: &str = "id, custom_id, task_type, status, content, retry_count, \
     next_retry_time, last_error, version, create_time, update_time";

const HISTORY_COLUMNS: &str =
    "id, task_id, round, succeeded, result, start_time, end_time, duration_ms";

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp out of range: {ms}")))
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::InvalidRow(format!("{column}={value}")))
}

/// Column values as read, before domain validation.
struct RawTask {
    id: i64,
    custom_id: String,
    task_type: i32,
    status: i64,
    content: Vec<u8>,
    retry_count: i64,
    next_retry_time: i64,
    last_error: String,
    version: i64,
    create_time: i64,
    update_time: i64,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            custom_id: row.get(1)?,
            task_type: row.get(2)?,
            status: row.get(3)?,
            content: row.get(4)?,
            retry_count: row.get(5)?,
            next_retry_time: row.get(6)?,
            last_error: row.get(7)?,
            version: row.get(8)?,
            create_time: row.get(9)?,
            update_time: row.get(10)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let status = TaskStatus::from_i64(self.status)
            .ok_or_else(|| StoreError::InvalidRow(format!("status={}", self.status)))?;
        Ok(Task {
            id: TaskId::new(self.id),
            custom_id: self.custom_id,
            task_type: TaskType::new(self.task_type),
            status,
            content: self.content,
            retry_count: to_u32(self.retry_count, "retry_count")?,
            next_retry_time: from_millis(self.next_retry_time)?,
            last_error: self.last_error,
            version: self.version,
            create_time: from_millis(self.create_time)?,
            update_time: from_millis(self.update_time)?,
        })
    }
}

struct RawHistory {
    id: i64,
    task_id: i64,
    round: i64,
    succeeded: bool,
    result: String,
    start_time: i64,
    end_time: i64,
    duration_ms: i64,
}

impl RawHistory {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            round: row.get(2)?,
            succeeded: row.get(3)?,
            result: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            duration_ms: row.get(7)?,
        })
    }

    fn into_history(self) -> Result<TaskHistory, StoreError> {
        Ok(TaskHistory {
            id: self.id,
            task_id: TaskId::new(self.task_id),
            round: to_u32(self.round, "round")?,
            succeeded: self.succeeded,
            result: self.result,
            start_time: from_millis(self.start_time)?,
            end_time: from_millis(self.end_time)?,
            duration_ms: self.duration_ms,
        })
    }
}

fn insert_row(conn: &Connection, task: &NewTask) -> Result<TaskId, StoreError> {
    let inserted = conn.execute(
        "INSERT INTO spindle_task \
             (custom_id, task_type, status, content, next_retry_time, create_time, update_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            task.custom_id,
            task.task_type.get(),
            TaskStatus::Pending.as_i64(),
            task.content,
            millis(task.next_retry_time),
            millis(task.create_time),
        ],
    );
    match inserted {
        Ok(_) => Ok(TaskId::new(conn.last_insert_rowid())),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(StoreError::DuplicateKey {
                task_type: task.task_type,
                custom_id: task.custom_id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn query_task(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Task>, StoreError> {
    conn.query_row(sql, params, RawTask::from_row)
        .optional()?
        .map(RawTask::into_task)
        .transpose()
}

/// Callers may write tasks through their own connection or open transaction.
impl TaskWriter for Connection {
    fn insert_task(&self, task: &NewTask) -> Result<TaskId, StoreError> {
        insert_row(self, task)
    }
}

impl TaskWriter for Transaction<'_> {
    fn insert_task(&self, task: &NewTask) -> Result<TaskId, StoreError> {
        insert_row(self, task)
    }
}

pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database; reach it through [`Self::with_connection`].
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Lend the store's connection, e.g. to open a transaction that also
    /// enqueues tasks.
    pub fn with_connection<T, E>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.lock().map_err(E::from)?;
        f(&mut conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

impl TaskWriter for SqliteTaskStore {
    fn insert_task(&self, task: &NewTask) -> Result<TaskId, StoreError> {
        let conn = self.lock()?;
        insert_row(&conn, task)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        debug!("sqlite schema ensured");
        Ok(())
    }

    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError> {
        self.insert_task(&task)
    }

    async fn claim_next(
        &self,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        let candidate = query_task(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM spindle_task \
                 WHERE task_type = ?1 AND status = ?2 AND next_retry_time < ?3 \
                 ORDER BY next_retry_time ASC, id ASC LIMIT 1"
            ),
            params![task_type.get(), TaskStatus::Pending.as_i64(), millis(now)],
        )?;
        let Some(mut task) = candidate else {
            return Ok(None);
        };

        let updated = conn.execute(
            "UPDATE spindle_task SET status = ?1, version = version + 1, update_time = ?2 \
             WHERE id = ?3 AND version = ?4",
            params![
                TaskStatus::Processing.as_i64(),
                millis(now),
                task.id.get(),
                task.version
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::ClaimConflict(task.id));
        }

        task.status = TaskStatus::Processing;
        task.version += 1;
        task.update_time = now;
        Ok(Some(task))
    }

    async fn peek_earliest_pending(&self, task_type: TaskType) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        query_task(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM spindle_task \
                 WHERE task_type = ?1 AND status = ?2 \
                 ORDER BY next_retry_time ASC, id ASC LIMIT 1"
            ),
            params![task_type.get(), TaskStatus::Pending.as_i64()],
        )
    }

    async fn commit_outcome(
        &self,
        task: &Task,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let retry_count = if outcome.is_success() {
            task.retry_count
        } else {
            task.retry_count + 1
        };

        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE spindle_task SET status = ?1, version = version + 1, retry_count = ?2, \
                 next_retry_time = ?3, last_error = ?4, update_time = ?5 \
             WHERE id = ?6 AND version = ?7",
            params![
                outcome.status().as_i64(),
                i64::from(retry_count),
                millis(outcome.next_retry_time()),
                outcome.last_error(),
                millis(now),
                task.id.get(),
                task.version,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::VersionConflict {
                id: task.id,
                expected: task.version,
            });
        }
        Ok(())
    }

    async fn reset_stale_processing(
        &self,
        scope: Option<TaskType>,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let pending = TaskStatus::Pending.as_i64();
        let processing = TaskStatus::Processing.as_i64();
        let updated = match scope {
            Some(task_type) => conn.execute(
                "UPDATE spindle_task SET status = ?1, version = version + 1, update_time = ?2 \
                 WHERE status = ?3 AND update_time < ?4 AND task_type = ?5",
                params![pending, millis(now), processing, millis(stale_before), task_type.get()],
            )?,
            None => conn.execute(
                "UPDATE spindle_task SET status = ?1, version = version + 1, update_time = ?2 \
                 WHERE status = ?3 AND update_time < ?4",
                params![pending, millis(now), processing, millis(stale_before)],
            )?,
        };
        Ok(updated as u64)
    }

    async fn append_history(&self, entry: NewHistory) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO spindle_task_history \
                 (task_id, round, succeeded, result, start_time, end_time, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.task_id.get(),
                i64::from(entry.round),
                entry.succeeded,
                entry.result,
                millis(entry.start_time),
                millis(entry.end_time),
                entry.duration_ms(),
            ],
        )?;
        Ok(())
    }

    async fn get_by_custom_id(&self, custom_id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        query_task(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM spindle_task WHERE custom_id = ?1 \
                 ORDER BY id ASC LIMIT 1"
            ),
            params![custom_id],
        )
    }

    async fn find_by_custom_id(
        &self,
        custom_id: &str,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        query_task(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM spindle_task \
                 WHERE custom_id = ?1 AND task_type = ?2 ORDER BY id ASC LIMIT 1"
            ),
            params![custom_id, task_type.get()],
        )
    }

    async fn get_history(&self, task_id: TaskId) -> Result<Vec<TaskHistory>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM spindle_task_history \
             WHERE task_id = ?1 ORDER BY round ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![task_id.get()], RawHistory::from_row)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(RawHistory::into_history))
            .collect()
    }
}
