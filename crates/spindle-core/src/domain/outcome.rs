//! Outcome of one attempt, as committed to the task row.

use chrono::{DateTime, Utc};

use super::TaskStatus;
use super::history::SUCCESS_RESULT;

/// What the worker decided after running a handler.
///
/// - `Succeeded`: row goes to Success, error cleared.
/// - `Failed`: row goes back to Pending with `retry_count + 1` and the
///   backoff-derived `next_retry_time`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Failed {
        error: String,
        next_retry_time: DateTime<Utc>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// Status the row ends up in.
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Succeeded => TaskStatus::Success,
            Outcome::Failed { .. } => TaskStatus::Pending,
        }
    }

    /// `next_retry_time` column value. Success resets it to the Unix epoch.
    pub fn next_retry_time(&self) -> DateTime<Utc> {
        match self {
            Outcome::Succeeded => DateTime::<Utc>::default(),
            Outcome::Failed {
                next_retry_time, ..
            } => *next_retry_time,
        }
    }

    /// `last_error` column value.
    pub fn last_error(&self) -> &str {
        match self {
            Outcome::Succeeded => "",
            Outcome::Failed { error, .. } => error,
        }
    }

    /// Text stored in the history row.
    pub fn history_result(&self) -> &str {
        match self {
            Outcome::Succeeded => SUCCESS_RESULT,
            Outcome::Failed { error, .. } => error,
        }
    }
}
