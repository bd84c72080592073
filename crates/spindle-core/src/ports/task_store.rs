//! TaskStore port: the durable source of truth for tasks and history.
//!
//! # Contract
//! - All mutation is compare-and-swap on the `version` column. No in-process
//!   lock guards a cross-process invariant.
//! - Stores never read wall time; callers pass `now`.
//! - `claim_next` is the only way a row becomes Processing, and
//!   `commit_outcome` / `reset_stale_processing` are the only ways it leaves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{NewHistory, NewTask, Outcome, Task, TaskHistory, TaskId, TaskType};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A non-empty `custom_id` already exists for this task type.
    #[error("duplicate custom_id {custom_id:?} for task_type={task_type}")]
    DuplicateKey {
        task_type: TaskType,
        custom_id: String,
    },

    /// Another claimant updated the row between select and CAS.
    #[error("claim conflict on {0}")]
    ClaimConflict(TaskId),

    /// Outcome commit found a different version than the one claimed.
    #[error("version conflict on {id} (expected version {expected})")]
    VersionConflict { id: TaskId, expected: i64 },

    /// A stored row could not be mapped back to the domain model.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Expected races that callers retry silently.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ClaimConflict(_))
    }
}

/// Synchronous insert used for transactional enqueue.
///
/// The manager writes new tasks through whatever the caller hands it: an open
/// `rusqlite::Transaction`, a bare connection, or a store. Task creation thus
/// commits or rolls back together with the caller's own business write.
pub trait TaskWriter {
    fn insert_task(&self, task: &NewTask) -> Result<TaskId, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create tables and indexes if missing. Idempotent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Non-transactional insert.
    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError>;

    /// Claim the earliest eligible Pending task of `task_type`.
    ///
    /// Eligible means `next_retry_time < now`. Returns the task with its
    /// version already incremented, `None` when nothing is eligible, and
    /// [`StoreError::ClaimConflict`] when another claimant won the row.
    async fn claim_next(
        &self,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Soonest Pending task of `task_type`, eligible or not. Read-only.
    async fn peek_earliest_pending(&self, task_type: TaskType) -> Result<Option<Task>, StoreError>;

    /// Persist an attempt outcome for a claimed task (CAS on `task.version`).
    async fn commit_outcome(
        &self,
        task: &Task,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reset Processing rows whose `update_time < stale_before` to Pending.
    /// `scope = None` sweeps every task type. Returns the number of rows reset.
    async fn reset_stale_processing(
        &self,
        scope: Option<TaskType>,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn append_history(&self, entry: NewHistory) -> Result<(), StoreError>;

    /// Task with this fingerprint. When it exists under several types the
    /// earliest created row wins.
    async fn get_by_custom_id(&self, custom_id: &str) -> Result<Option<Task>, StoreError>;

    async fn find_by_custom_id(
        &self,
        custom_id: &str,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError>;

    /// History of a task ordered by round.
    async fn get_history(&self, task_id: TaskId) -> Result<Vec<TaskHistory>, StoreError>;
}
