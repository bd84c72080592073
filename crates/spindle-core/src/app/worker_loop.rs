//! WorkerLoop - タスク実行ループ
//!
//! One loop per registered task type:
//! wait (wake signal / next fetch time / shutdown) → claim → execute → commit
//! outcome → append history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::domain::{NewHistory, Outcome, Task, TaskId, TaskType};
use crate::ports::{Clock, StoreError, TaskStore, add_std, until};
use crate::queue::{RetryPolicy, WakeReceiver};
use crate::runtime::Runtime;

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    /// A task was claimed and run. `succeeded` is the handler's verdict,
    /// independent of whether the outcome could be committed.
    Executed { task_id: TaskId, succeeded: bool },
    /// Nothing eligible.
    Idle,
    /// Another claimant won the row.
    Conflict,
    /// The store failed; the worker backs off.
    StoreFailed,
}

/// Result of one poll plus when the next one is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iteration {
    pub polled: Polled,
    pub next_fetch: DateTime<Utc>,
}

pub struct WorkerLoop {
    task_type: TaskType,
    name: String,
    store: Arc<dyn TaskStore>,
    runtime: Arc<Runtime>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    init_interval: Duration,
    query_interval: Duration,
    err_sleep_interval: Duration,
}

impl WorkerLoop {
    pub fn new(
        task_type: TaskType,
        store: Arc<dyn TaskStore>,
        runtime: Arc<Runtime>,
        clock: Arc<dyn Clock>,
        config: &ManagerConfig,
    ) -> Self {
        let name = runtime.registry().display_name(task_type);
        Self {
            task_type,
            name,
            store,
            runtime,
            clock,
            retry: config.retry_policy(),
            init_interval: config.init_interval(),
            query_interval: config.query_interval(),
            err_sleep_interval: config.err_sleep_interval(),
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Run until `shutdown` fires. Nothing is claimed after that; a handler
    /// already running sees its token cancelled and is awaited.
    pub async fn run(self, mut wake: WakeReceiver, shutdown: CancellationToken) {
        info!(task_type = %self.task_type, name = %self.name, "worker started");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(task_type = %self.task_type, name = %self.name, "worker exited");
                return;
            }
            _ = tokio::time::sleep(self.init_interval) => {}
        }

        let mut next_fetch = self.clock.now();
        loop {
            let wait = until(self.clock.now(), next_fetch);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(()) = wake.recv() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            next_fetch = self.poll_once(&shutdown).await.next_fetch;
        }

        info!(task_type = %self.task_type, name = %self.name, "worker exited");
    }

    /// One claim → execute → commit round.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Iteration {
        let now = self.clock.now();
        let task = match self.store.claim_next(self.task_type, now).await {
            Ok(Some(task)) => task,
            Ok(None) => return self.idle(now).await,
            Err(e) if e.is_conflict() => {
                debug!(task_type = %self.task_type, error = %e, "claim race lost, retrying");
                return Iteration {
                    polled: Polled::Conflict,
                    next_fetch: now,
                };
            }
            Err(e) => {
                error!(task_type = %self.task_type, error = %e, "claim failed");
                return Iteration {
                    polled: Polled::StoreFailed,
                    next_fetch: add_std(now, self.err_sleep_interval),
                };
            }
        };

        let task_id = task.id;
        let succeeded = self.execute(task, shutdown).await;
        Iteration {
            polled: Polled::Executed { task_id, succeeded },
            next_fetch: self.clock.now(),
        }
    }

    async fn idle(&self, now: DateTime<Utc>) -> Iteration {
        let next_fetch = match self.store.peek_earliest_pending(self.task_type).await {
            Ok(Some(task)) => task.next_retry_time,
            Ok(None) => add_std(now, self.query_interval),
            Err(e) => {
                error!(task_type = %self.task_type, error = %e, "peek failed");
                add_std(now, self.err_sleep_interval)
            }
        };
        Iteration {
            polled: Polled::Idle,
            next_fetch,
        }
    }

    async fn execute(&self, task: Task, shutdown: &CancellationToken) -> bool {
        let round = task.round();
        let start_time = self.clock.now();
        let result = self
            .runtime
            .execute(task.clone(), shutdown.child_token())
            .await;
        let end_time = self.clock.now();

        let outcome = match &result {
            Ok(()) => Outcome::Succeeded,
            Err(e) => Outcome::Failed {
                error: e.to_string(),
                next_retry_time: self.retry.next_retry_time(end_time, task.retry_count),
            },
        };

        match self.store.commit_outcome(&task, &outcome, end_time).await {
            Ok(()) => {}
            Err(e @ StoreError::VersionConflict { .. }) => {
                // reaper か別プロセスが先に更新した
                warn!(
                    task_type = %self.task_type,
                    task_id = %task.id,
                    version = task.version,
                    error = %e,
                    "outcome not committed, row changed under the worker"
                );
                return outcome.is_success();
            }
            Err(e) => {
                error!(task_type = %self.task_type, task_id = %task.id, error = %e, "commit failed");
                return outcome.is_success();
            }
        }

        match &outcome {
            Outcome::Succeeded => {
                debug!(task_type = %self.task_type, task_id = %task.id, round, "task succeeded");
            }
            Outcome::Failed {
                error,
                next_retry_time,
            } => {
                debug!(
                    task_type = %self.task_type,
                    task_id = %task.id,
                    round,
                    error = %error,
                    next_retry_time = %next_retry_time,
                    "task failed"
                );
            }
        }

        let entry = NewHistory {
            task_id: task.id,
            round,
            succeeded: outcome.is_success(),
            result: outcome.history_result().to_string(),
            start_time,
            end_time,
        };
        if let Err(e) = self.store.append_history(entry).await {
            warn!(task_type = %self.task_type, task_id = %task.id, round, error = %e, "history append failed");
        }

        outcome.is_success()
    }
}
