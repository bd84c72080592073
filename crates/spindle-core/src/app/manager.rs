//! Manager - 全体のワイヤリングと公開 API
//!
//! Owns the handler registry, one wake channel per type, the worker tasks and
//! the reaper. Constructed explicitly; any number of managers (or processes)
//! may share one store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::app::reaper_loop::ReaperLoop;
use crate::app::status::TaskResult;
use crate::app::worker_loop::WorkerLoop;
use crate::config::ManagerConfig;
use crate::domain::{HandlerError, NewTask, Task, TaskId, TaskType};
use crate::error::SpindleError;
use crate::ports::{Clock, SystemClock, TaskStore, TaskWriter};
use crate::queue::{WakeReceiver, WakeResult, WakeSender, wake_channel};
use crate::runtime::{FnHandler, HandlerRegistry, Runtime, TaskHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Closed,
}

struct State {
    lifecycle: Lifecycle,
    registry: Arc<HandlerRegistry>,
    wake_senders: HashMap<TaskType, WakeSender>,
    wake_receivers: HashMap<TaskType, WakeReceiver>,
    joins: Vec<(String, JoinHandle<()>)>,
}

pub struct Manager {
    config: ManagerConfig,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    state: Mutex<State>,
    terminated: Arc<Mutex<Vec<String>>>,
}

/// Run `fut` as its own task and report an abnormal end (panic) as soon as it
/// happens instead of when `stop()` gets around to joining.
fn supervise<F>(name: String, terminated: Arc<Mutex<Vec<String>>>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = inner.await {
            if e.is_panic() {
                error!(worker = %name, error = %e, "worker terminated");
                terminated
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(name);
            }
        }
    })
}

impl Manager {
    pub fn new(config: ManagerConfig, store: Arc<dyn TaskStore>) -> Result<Self, SpindleError> {
        Ok(Self {
            config: config.validate()?,
            store,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            state: Mutex::new(State {
                lifecycle: Lifecycle::Idle,
                registry: Arc::new(HandlerRegistry::new()),
                wake_senders: HashMap::new(),
                wake_receivers: HashMap::new(),
                joins: Vec::new(),
            }),
            terminated: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Replace the time source (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the handler for `task_type`. Only allowed before `start`.
    pub fn register_handler(
        &self,
        task_type: TaskType,
        display_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), SpindleError> {
        let mut state = self.lock();
        match state.lifecycle {
            Lifecycle::Closed => return Err(SpindleError::ManagerClosed),
            Lifecycle::Running => return Err(SpindleError::AlreadyStarted),
            Lifecycle::Idle => {}
        }
        let registry = Arc::get_mut(&mut state.registry).ok_or(SpindleError::AlreadyStarted)?;
        registry.register(task_type, display_name, handler)?;

        let (tx, rx) = wake_channel();
        state.wake_senders.insert(task_type, tx);
        state.wake_receivers.insert(task_type, rx);

        info!(task_type = %task_type, name = %state.registry.display_name(task_type), "handler registered");
        Ok(())
    }

    /// Closure form of [`Manager::register_handler`].
    pub fn register_fn<F, Fut>(
        &self,
        task_type: TaskType,
        display_name: impl Into<String>,
        f: F,
    ) -> Result<(), SpindleError>
    where
        F: Fn(CancellationToken, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register_handler(task_type, display_name, Arc::new(FnHandler::new(f)))
    }

    /// Ensure the schema, then spawn one worker per registered type and the
    /// reaper. Must be called inside a tokio runtime.
    pub async fn start(&self) -> Result<(), SpindleError> {
        let (registry, receivers) = {
            let mut state = self.lock();
            match state.lifecycle {
                Lifecycle::Closed => return Err(SpindleError::ManagerClosed),
                Lifecycle::Running => return Err(SpindleError::AlreadyStarted),
                Lifecycle::Idle => {}
            }
            if state.registry.is_empty() {
                return Err(SpindleError::NoHandlers);
            }
            state.lifecycle = Lifecycle::Running;
            (
                Arc::clone(&state.registry),
                std::mem::take(&mut state.wake_receivers),
            )
        };

        if let Err(e) = self.store.ensure_schema().await {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Running {
                state.lifecycle = Lifecycle::Idle;
            }
            state.wake_receivers = receivers;
            return Err(e.into());
        }

        let runtime = Arc::new(Runtime::new(registry.clone(), self.config.task_timeout()));
        let mut state = self.lock();
        if state.lifecycle == Lifecycle::Closed {
            // stop() が ensure_schema 中に呼ばれた
            return Err(SpindleError::ManagerClosed);
        }

        for (task_type, wake) in receivers {
            let worker = WorkerLoop::new(
                task_type,
                Arc::clone(&self.store),
                Arc::clone(&runtime),
                Arc::clone(&self.clock),
                &self.config,
            );
            let name = registry.display_name(worker.task_type());
            let join = supervise(
                name.clone(),
                Arc::clone(&self.terminated),
                worker.run(wake, self.shutdown.clone()),
            );
            state.joins.push((name, join));
        }

        let reaper = ReaperLoop::new(Arc::clone(&self.store), Arc::clone(&self.clock), &self.config);
        let join = supervise(
            "reaper".to_string(),
            Arc::clone(&self.terminated),
            reaper.run(self.shutdown.clone()),
        );
        state.joins.push(("reaper".to_string(), join));

        info!(workers = registry.len(), "manager started");
        Ok(())
    }

    /// Stop every worker and the reaper and wait for them. Idempotent; a
    /// concurrent second call returns immediately.
    pub async fn stop(&self) {
        let joins = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
            self.shutdown.cancel();
            std::mem::take(&mut state.joins)
        };

        // 異常終了は supervise 側でログ済み
        for (name, join) in joins {
            if let Err(e) = join.await {
                warn!(worker = %name, error = %e, "worker did not finish cleanly");
            }
        }
        info!("manager stopped");
    }

    /// Enqueue a task that is eligible immediately.
    ///
    /// The row is written through `writer`, so it commits or rolls back with
    /// the caller's transaction. Call [`Manager::wake_up`] after the commit
    /// for low-latency pickup.
    pub fn add_task<W: TaskWriter + ?Sized>(
        &self,
        writer: &W,
        task_type: TaskType,
        custom_id: &str,
        content: impl Into<Vec<u8>>,
    ) -> Result<TaskId, SpindleError> {
        self.ensure_open()?;
        let task = NewTask::immediate(task_type, custom_id, content, self.clock.now());
        Ok(writer.insert_task(&task)?)
    }

    /// Enqueue a task that becomes eligible after `at`.
    pub fn add_scheduled_task<W: TaskWriter + ?Sized>(
        &self,
        writer: &W,
        task_type: TaskType,
        custom_id: &str,
        content: impl Into<Vec<u8>>,
        at: DateTime<Utc>,
    ) -> Result<TaskId, SpindleError> {
        self.ensure_open()?;
        let task = NewTask::scheduled(task_type, custom_id, content, at, self.clock.now());
        Ok(writer.insert_task(&task)?)
    }

    /// Nudge the worker of `task_type` to poll now. Never blocks; wake-ups
    /// sent before the worker gets to them collapse into one.
    pub fn wake_up(&self, task_type: TaskType) {
        let sender = self.lock().wake_senders.get(&task_type).cloned();
        let Some(sender) = sender else {
            warn!(task_type = %task_type, "wake_up for unregistered task type");
            return;
        };
        match sender.wake() {
            WakeResult::Sent => trace!(task_type = %task_type, "wake signal sent"),
            WakeResult::Coalesced => trace!(task_type = %task_type, "wake signal already pending"),
            WakeResult::Closed => trace!(task_type = %task_type, "worker gone, wake dropped"),
        }
    }

    /// Task with this fingerprint, its history and type name. `None` when no
    /// such task exists.
    pub async fn get_task_result(&self, custom_id: &str) -> Result<Option<TaskResult>, SpindleError> {
        let Some(task) = self.store.get_by_custom_id(custom_id).await? else {
            return Ok(None);
        };
        let history = self.store.get_history(task.id).await?;
        let task_type_name = self.display_name(task.task_type);
        Ok(Some(TaskResult {
            task,
            task_type_name,
            history,
        }))
    }

    pub async fn task_exists(&self, custom_id: &str, task_type: TaskType) -> Result<bool, SpindleError> {
        Ok(self
            .store
            .find_by_custom_id(custom_id, task_type)
            .await?
            .is_some())
    }

    pub fn display_name(&self, task_type: TaskType) -> String {
        self.lock().registry.display_name(task_type)
    }

    pub fn is_running(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Running
    }

    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Closed
    }

    /// Names of workers (and `"reaper"`) that ended with a panic. They are
    /// not restarted.
    pub fn terminated_workers(&self) -> Vec<String> {
        self.terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_open(&self) -> Result<(), SpindleError> {
        if self.is_closed() {
            return Err(SpindleError::ManagerClosed);
        }
        Ok(())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
