//! Fault-injecting wrapper around [`MemoryTaskStore`] for tests.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::MemoryTaskStore;
use crate::domain::{NewHistory, NewTask, Outcome, Task, TaskHistory, TaskId, TaskType};
use crate::ports::{StoreError, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    ClaimUnavailable,
    ClaimConflict,
    ClaimPanics,
    PeekUnavailable,
    CommitUnavailable,
    HistoryUnavailable,
}

#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryTaskStore,
    faults: Mutex<HashSet<Fault>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fault);
    }

    pub fn clear(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fault);
    }

    pub fn inner(&self) -> &MemoryTaskStore {
        &self.inner
    }

    fn has(&self, fault: Fault) -> bool {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&fault)
    }

    fn unavailable(what: &str) -> StoreError {
        StoreError::Unavailable(format!("injected {what} failure"))
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner.ensure_schema().await
    }

    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError> {
        self.inner.insert(task).await
    }

    async fn claim_next(
        &self,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        if self.has(Fault::ClaimPanics) {
            panic!("injected claim panic");
        }
        if self.has(Fault::ClaimUnavailable) {
            return Err(Self::unavailable("claim"));
        }
        if self.has(Fault::ClaimConflict) {
            let id = self
                .inner
                .peek_earliest_pending(task_type)
                .await?
                .map_or(TaskId::new(0), |t| t.id);
            return Err(StoreError::ClaimConflict(id));
        }
        self.inner.claim_next(task_type, now).await
    }

    async fn peek_earliest_pending(&self, task_type: TaskType) -> Result<Option<Task>, StoreError> {
        if self.has(Fault::PeekUnavailable) {
            return Err(Self::unavailable("peek"));
        }
        self.inner.peek_earliest_pending(task_type).await
    }

    async fn commit_outcome(
        &self,
        task: &Task,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.has(Fault::CommitUnavailable) {
            return Err(Self::unavailable("commit"));
        }
        self.inner.commit_outcome(task, outcome, now).await
    }

    async fn reset_stale_processing(
        &self,
        scope: Option<TaskType>,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.inner
            .reset_stale_processing(scope, stale_before, now)
            .await
    }

    async fn append_history(&self, entry: NewHistory) -> Result<(), StoreError> {
        if self.has(Fault::HistoryUnavailable) {
            return Err(Self::unavailable("history"));
        }
        self.inner.append_history(entry).await
    }

    async fn get_by_custom_id(&self, custom_id: &str) -> Result<Option<Task>, StoreError> {
        self.inner.get_by_custom_id(custom_id).await
    }

    async fn find_by_custom_id(
        &self,
        custom_id: &str,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError> {
        self.inner.find_by_custom_id(custom_id, task_type).await
    }

    async fn get_history(&self, task_id: TaskId) -> Result<Vec<TaskHistory>, StoreError> {
        self.inner.get_history(task_id).await
    }
}
