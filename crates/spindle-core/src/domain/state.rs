//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Persisted task status.
///
/// State transitions:
/// - Pending -> Processing (claim, version CAS)
/// - Processing -> Success
/// - Processing -> Pending (failure, retry_count + 1, backoff)
/// - Processing -> Pending (reaper, claim went stale)
///
/// There is no failed terminal state: failures always loop back to Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `next_retry_time`, eligible for claim after it.
    Pending,

    /// Claimed by a worker.
    Processing,

    /// Handler returned Ok and the outcome was committed.
    Success,
}

impl TaskStatus {
    /// Column encoding.
    pub fn as_i64(self) -> i64 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Success => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(TaskStatus::Pending),
            1 => Some(TaskStatus::Processing),
            2 => Some(TaskStatus::Success),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
        }
    }
}
