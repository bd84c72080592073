//! Status - タスク結果の参照
//!
//! Producers never see handler errors directly; this view (task row plus
//! every attempt) is how they find out what happened.

use serde::Serialize;

use crate::domain::{Task, TaskHistory, TaskStatus};

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task: Task,
    /// Registered display name of the task's type.
    pub task_type_name: String,
    /// Attempts ordered by round.
    pub history: Vec<TaskHistory>,
}

impl TaskResult {
    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn is_done(&self) -> bool {
        self.task.status.is_terminal()
    }

    pub fn last_attempt(&self) -> Option<&TaskHistory> {
        self.history.last()
    }
}
