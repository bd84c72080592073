//! In-memory task store.
//!
//! Follows the same optimistic protocol as the SQL store: a claim reads its
//! candidate under one lock acquisition and applies the version CAS under a
//! second one, so concurrent claimants genuinely race and can lose with
//! `ClaimConflict`. Good for tests and for embedding without a database.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    NewHistory, NewTask, Outcome, Task, TaskHistory, TaskId, TaskStatus, TaskType,
};
use crate::ports::{StoreError, TaskStore, TaskWriter};

struct MemoryState {
    /// All task rows (BTreeMap so "earliest created" is iteration order).
    tasks: BTreeMap<TaskId, Task>,
    history: Vec<TaskHistory>,
    next_task_id: i64,
    next_history_id: i64,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            history: Vec::new(),
            next_task_id: 1,
            next_history_id: 1,
        }
    }

    fn insert(&mut self, task: &NewTask) -> Result<TaskId, StoreError> {
        if !task.custom_id.is_empty()
            && self
                .tasks
                .values()
                .any(|t| t.task_type == task.task_type && t.custom_id == task.custom_id)
        {
            return Err(StoreError::DuplicateKey {
                task_type: task.task_type,
                custom_id: task.custom_id.clone(),
            });
        }

        let id = TaskId::new(self.next_task_id);
        self.next_task_id += 1;
        self.tasks.insert(id, task.clone().into_task(id));
        Ok(id)
    }

    fn earliest_pending(&self, task_type: TaskType, now: Option<DateTime<Utc>>) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.task_type == task_type)
            .filter(|t| match now {
                Some(now) => t.is_claimable(now),
                None => t.status == TaskStatus::Pending,
            })
            .min_by_key(|t| (t.next_retry_time, t.id))
    }
}

pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Current row by id.
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().ok()?.tasks.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskWriter for MemoryTaskStore {
    fn insert_task(&self, task: &NewTask) -> Result<TaskId, StoreError> {
        self.lock()?.insert(task)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
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
        let observed = {
            let state = self.lock()?;
            state
                .earliest_pending(task_type, Some(now))
                .map(|t| (t.id, t.version))
        };
        let Some((id, version)) = observed else {
            return Ok(None);
        };

        // CAS: id + observed version
        let mut state = self.lock()?;
        match state.tasks.get_mut(&id) {
            Some(row) if row.version == version => {
                row.status = TaskStatus::Processing;
                row.version += 1;
                row.update_time = now;
                Ok(Some(row.clone()))
            }
            _ => Err(StoreError::ClaimConflict(id)),
        }
    }

    async fn peek_earliest_pending(&self, task_type: TaskType) -> Result<Option<Task>, StoreError> {
        let state = self.lock()?;
        Ok(state.earliest_pending(task_type, None).cloned())
    }

    async fn commit_outcome(
        &self,
        task: &Task,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let row = match state.tasks.get_mut(&task.id) {
            Some(row) if row.version == task.version => row,
            _ => {
                return Err(StoreError::VersionConflict {
                    id: task.id,
                    expected: task.version,
                });
            }
        };

        row.status = outcome.status();
        row.version += 1;
        row.next_retry_time = outcome.next_retry_time();
        row.last_error = outcome.last_error().to_string();
        row.update_time = now;
        if !outcome.is_success() {
            row.retry_count = task.retry_count + 1;
        }
        Ok(())
    }

    async fn reset_stale_processing(
        &self,
        scope: Option<TaskType>,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut reset = 0;
        for row in state.tasks.values_mut() {
            if row.status != TaskStatus::Processing || row.update_time >= stale_before {
                continue;
            }
            if scope.is_some_and(|t| t != row.task_type) {
                continue;
            }
            row.status = TaskStatus::Pending;
            row.version += 1;
            row.update_time = now;
            reset += 1;
        }
        Ok(reset)
    }

    async fn append_history(&self, entry: NewHistory) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let id = state.next_history_id;
        state.next_history_id += 1;
        state.history.push(entry.into_history(id));
        Ok(())
    }

    async fn get_by_custom_id(&self, custom_id: &str) -> Result<Option<Task>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .values()
            .find(|t| t.custom_id == custom_id)
            .cloned())
    }

    async fn find_by_custom_id(
        &self,
        custom_id: &str,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .values()
            .find(|t| t.custom_id == custom_id && t.task_type == task_type)
            .cloned())
    }

    async fn get_history(&self, task_id: TaskId) -> Result<Vec<TaskHistory>, StoreError> {
        let state = self.lock()?;
        let mut rows: Vec<TaskHistory> = state
            .history
            .iter()
            .filter(|h| h.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| (h.round, h.id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use super::*;

    const TYPE_A: TaskType = TaskType::new(1);
    const TYPE_B: TaskType = TaskType::new(2);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    #[tokio::test]
    async fn duplicate_custom_id_is_rejected_per_type() {
        let store = MemoryTaskStore::new();
        store
            .insert(NewTask::immediate(TYPE_A, "order-1", Vec::new(), t0()))
            .await
            .unwrap();

        let err = store
            .insert(NewTask::immediate(TYPE_A, "order-1", Vec::new(), t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));

        // same fingerprint, other type: fine
        store
            .insert(NewTask::immediate(TYPE_B, "order-1", Vec::new(), t0()))
            .await
            .unwrap();

        // empty fingerprints are never unique
        store.insert(NewTask::immediate(TYPE_A, "", Vec::new(), t0())).await.unwrap();
        store.insert(NewTask::immediate(TYPE_A, "", Vec::new(), t0())).await.unwrap();
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn claim_picks_earliest_eligible_of_its_type() {
        let store = MemoryTaskStore::new();
        let late = store
            .insert(NewTask::scheduled(TYPE_A, "late", Vec::new(), t0() + ms(50), t0()))
            .await
            .unwrap();
        let early = store
            .insert(NewTask::scheduled(TYPE_A, "early", Vec::new(), t0() + ms(10), t0()))
            .await
            .unwrap();
        store
            .insert(NewTask::immediate(TYPE_B, "other", Vec::new(), t0()))
            .await
            .unwrap();

        // nothing is strictly before t0 + 10ms
        assert!(store.claim_next(TYPE_A, t0() + ms(10)).await.unwrap().is_none());

        let claimed = store.claim_next(TYPE_A, t0() + ms(100)).await.unwrap().unwrap();
        assert_eq!(claimed.id, early);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.version, 1);
        assert_eq!(claimed.update_time, t0() + ms(100));

        let next = store.claim_next(TYPE_A, t0() + ms(100)).await.unwrap().unwrap();
        assert_eq!(next.id, late);
        assert!(store.claim_next(TYPE_A, t0() + ms(100)).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_claim_under_concurrent_claimants() {
        let store = Arc::new(MemoryTaskStore::new());
        store
            .insert(NewTask::immediate(TYPE_A, "contended", Vec::new(), t0()))
            .await
            .unwrap();

        let mut joins = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                store.claim_next(TYPE_A, t0() + ms(1)).await
            }));
        }

        let mut won = 0;
        for join in joins {
            match join.await.unwrap() {
                Ok(Some(_)) => won += 1,
                Ok(None) => {}
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn commit_is_a_version_cas() {
        let store = MemoryTaskStore::new();
        store
            .insert(NewTask::immediate(TYPE_A, "c", Vec::new(), t0()))
            .await
            .unwrap();
        let claimed = store.claim_next(TYPE_A, t0() + ms(1)).await.unwrap().unwrap();

        let failed = Outcome::Failed {
            error: "boom".into(),
            next_retry_time: t0() + Duration::seconds(2),
        };
        store.commit_outcome(&claimed, &failed, t0() + ms(5)).await.unwrap();

        let row = store.get(claimed.id).unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.version, 2);
        assert_eq!(row.last_error, "boom");
        assert_eq!(row.next_retry_time, t0() + Duration::seconds(2));

        // replaying the same claim is rejected
        let err = store
            .commit_outcome(&claimed, &Outcome::Succeeded, t0() + ms(6))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, .. }));
    }

    #[tokio::test]
    async fn success_clears_last_error_and_keeps_retry_count() {
        let store = MemoryTaskStore::new();
        store
            .insert(NewTask::immediate(TYPE_A, "c", Vec::new(), t0()))
            .await
            .unwrap();
        let first = store.claim_next(TYPE_A, t0() + ms(1)).await.unwrap().unwrap();
        let failed = Outcome::Failed {
            error: "boom".into(),
            next_retry_time: t0() + ms(2),
        };
        store.commit_outcome(&first, &failed, t0() + ms(1)).await.unwrap();

        let second = store.claim_next(TYPE_A, t0() + ms(3)).await.unwrap().unwrap();
        store.commit_outcome(&second, &Outcome::Succeeded, t0() + ms(4)).await.unwrap();

        let row = store.get(second.id).unwrap();
        assert_eq!(row.status, TaskStatus::Success);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.last_error, "");
        assert_eq!(row.next_retry_time.timestamp(), 0);
    }

    #[tokio::test]
    async fn reset_only_touches_stale_processing_rows() {
        let store = MemoryTaskStore::new();
        store.insert(NewTask::immediate(TYPE_A, "a", Vec::new(), t0())).await.unwrap();
        store.insert(NewTask::immediate(TYPE_B, "b", Vec::new(), t0())).await.unwrap();
        store.insert(NewTask::immediate(TYPE_A, "idle", Vec::new(), t0() + ms(500))).await.unwrap();

        let stale = store.claim_next(TYPE_A, t0() + ms(1)).await.unwrap().unwrap();
        let fresh = store.claim_next(TYPE_B, t0() + ms(100)).await.unwrap().unwrap();

        let reset = store
            .reset_stale_processing(None, t0() + ms(50), t0() + ms(200))
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let row = store.get(stale.id).unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert_eq!(row.version, stale.version + 1);
        assert_eq!(store.get(fresh.id).unwrap().status, TaskStatus::Processing);

        // the stale claimant now loses its commit
        let err = store
            .commit_outcome(&stale, &Outcome::Succeeded, t0() + ms(300))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn scoped_reset_ignores_other_types() {
        let store = MemoryTaskStore::new();
        store.insert(NewTask::immediate(TYPE_B, "b", Vec::new(), t0())).await.unwrap();
        store.claim_next(TYPE_B, t0() + ms(1)).await.unwrap().unwrap();

        let reset = store
            .reset_stale_processing(Some(TYPE_A), t0() + ms(50), t0() + ms(60))
            .await
            .unwrap();
        assert_eq!(reset, 0);
    }

    #[tokio::test]
    async fn lookups_and_history_order() {
        let store = MemoryTaskStore::new();
        let id = store
            .insert(NewTask::immediate(TYPE_A, "cust-1", Vec::new(), t0()))
            .await
            .unwrap();
        store
            .insert(NewTask::immediate(TYPE_B, "cust-1", Vec::new(), t0()))
            .await
            .unwrap();

        assert_eq!(store.get_by_custom_id("cust-1").await.unwrap().unwrap().id, id);
        assert!(store.get_by_custom_id("nope").await.unwrap().is_none());
        assert_eq!(
            store.find_by_custom_id("cust-1", TYPE_B).await.unwrap().unwrap().task_type,
            TYPE_B
        );

        for round in [2, 1] {
            store
                .append_history(NewHistory {
                    task_id: id,
                    round,
                    succeeded: round == 2,
                    result: format!("round {round}"),
                    start_time: t0(),
                    end_time: t0() + ms(10),
                })
                .await
                .unwrap();
        }
        let history = store.get_history(id).await.unwrap();
        assert_eq!(history.iter().map(|h| h.round).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(history[0].duration_ms, 10);
    }

    #[tokio::test]
    async fn peek_sees_future_tasks() {
        let store = MemoryTaskStore::new();
        assert!(store.peek_earliest_pending(TYPE_A).await.unwrap().is_none());
        store
            .insert(NewTask::scheduled(TYPE_A, "f", Vec::new(), t0() + Duration::hours(1), t0()))
            .await
            .unwrap();
        let peeked = store.peek_earliest_pending(TYPE_A).await.unwrap().unwrap();
        assert_eq!(peeked.next_retry_time, t0() + Duration::hours(1));
        assert_eq!(peeked.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn claim_agrees_with_is_claimable() {
        let store = MemoryTaskStore::new();
        let due = t0() + ms(10);
        let id = store
            .insert(NewTask::scheduled(TYPE_A, "edge", Vec::new(), due, t0()))
            .await
            .unwrap();

        let row = store.get(id).unwrap();
        assert!(!row.is_claimable(due));
        assert!(store.claim_next(TYPE_A, due).await.unwrap().is_none());
        assert_eq!(store.peek_earliest_pending(TYPE_A).await.unwrap().map(|t| t.id), Some(id));

        assert!(row.is_claimable(due + ms(1)));
        let claimed = store.claim_next(TYPE_A, due + ms(1)).await.unwrap().unwrap();
        assert!(!claimed.is_claimable(due + ms(1)));

        // Processing rows are invisible to peek as well
        assert!(store.peek_earliest_pending(TYPE_A).await.unwrap().is_none());
    }
}
