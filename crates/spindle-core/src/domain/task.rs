use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus, TaskType};

/// A task row as stored.
///
/// `version` is the only concurrency-control field: every transition
/// (claim, outcome commit, reaper reset) is a compare-and-swap on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub custom_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,

    /// Opaque payload. Handlers decode it themselves.
    pub content: Vec<u8>,

    /// Number of failed attempts so far.
    pub retry_count: u32,

    /// Earliest instant at which the task may be claimed.
    pub next_retry_time: DateTime<Utc>,

    /// Most recent failure text, empty after success.
    pub last_error: String,

    pub version: i64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Task {
    /// Decode a JSON payload.
    pub fn content_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }

    /// 1-based attempt number of the execution that follows a claim.
    pub fn round(&self) -> u32 {
        self.retry_count + 1
    }

    /// Eligible for claim at `now` (strictly after `next_retry_time`).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_retry_time < now
    }
}

/// Insert request for a new task. Created by the manager, written through a
/// [`TaskWriter`](crate::ports::TaskWriter).
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: TaskType,
    pub custom_id: String,
    pub content: Vec<u8>,
    pub next_retry_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
}

impl NewTask {
    /// Task that becomes eligible immediately.
    pub fn immediate(
        task_type: TaskType,
        custom_id: impl Into<String>,
        content: impl Into<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::scheduled(task_type, custom_id, content, now, now)
    }

    /// Task that becomes eligible after `at`.
    pub fn scheduled(
        task_type: TaskType,
        custom_id: impl Into<String>,
        content: impl Into<Vec<u8>>,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_type,
            custom_id: custom_id.into(),
            content: content.into(),
            next_retry_time: at,
            create_time: now,
        }
    }

    /// Materialize the row a store keeps after assigning `id`.
    pub fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            custom_id: self.custom_id,
            task_type: self.task_type,
            status: TaskStatus::Pending,
            content: self.content,
            retry_count: 0,
            next_retry_time: self.next_retry_time,
            last_error: String::new(),
            version: 0,
            create_time: self.create_time,
            update_time: self.create_time,
        }
    }
}
