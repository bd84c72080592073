//! Domain identifiers (strongly-typed IDs).
//!
//! Both IDs are plain integers on the wire so they map directly onto table
//! columns, but they are distinct types in code: a `TaskId` can never be
//! passed where a `TaskType` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned task identifier (the table's primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Application-defined task type.
///
/// The set of values is owned by the caller (usually an enum cast to `i32`).
/// Each registered type gets its own worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(i32);

impl TaskType {
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn get(self) -> i32 {
        self.0
    }

    /// Fallback label used when no display name was registered.
    pub fn default_name(self) -> String {
        format!("TaskType[{}]", self.0)
    }
}

impl From<i32> for TaskType {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
