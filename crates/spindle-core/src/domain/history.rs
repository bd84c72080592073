//! Execution history: one append-only row per attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Result text recorded for a successful attempt.
pub const SUCCESS_RESULT: &str = "success";

/// A single execution attempt of a task.
///
/// This is what `get_task_result` uses to explain what happened to a task:
/// failures never reach the producer any other way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub id: i64,
    pub task_id: TaskId,

    /// 1-based attempt number (`retry_count` at execution time + 1).
    pub round: u32,

    pub succeeded: bool,

    /// `"success"` or the error text.
    pub result: String,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Append request for a history row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistory {
    pub task_id: TaskId,
    pub round: u32,
    pub succeeded: bool,
    pub result: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl NewHistory {
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds().max(0)
    }

    pub fn into_history(self, id: i64) -> TaskHistory {
        let duration_ms = self.duration_ms();
        TaskHistory {
            id,
            task_id: self.task_id,
            round: self.round,
            succeeded: self.succeeded,
            result: self.result,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn duration_is_measured_in_millis_and_never_negative() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = NewHistory {
            task_id: TaskId::new(1),
            round: 1,
            succeeded: true,
            result: SUCCESS_RESULT.to_string(),
            start_time: start,
            end_time: start + Duration::milliseconds(1500),
        };
        assert_eq!(entry.duration_ms(), 1500);

        let skewed = NewHistory {
            end_time: start - Duration::seconds(1),
            ..entry
        };
        assert_eq!(skewed.into_history(9).duration_ms, 0);
    }
}
