use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::domain::{HandlerError, Task, TaskType};
use crate::error::SpindleError;

/// A handler for a specific task type.
///
/// Takes the whole `Task` so the handler can decode `content` as it likes.
/// `cancel` fires when the deadline passes or the manager stops; handlers
/// doing long work should watch it.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, task: &Task) -> Result<(), HandlerError>;
}

/// Closure-backed handler. Each call gets an owned copy of the task.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(CancellationToken, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, task: &Task) -> Result<(), HandlerError> {
        (self.f)(cancel, task.clone()).await
    }
}

struct Registration {
    display_name: String,
    handler: Arc<dyn TaskHandler>,
}

/// Registry of handlers (task_type -> handler + display name).
///
/// Built before start (mutable), shared read-only by the workers afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a task type. An empty display name becomes
    /// `TaskType[n]`.
    pub fn register(
        &mut self,
        task_type: TaskType,
        display_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), SpindleError> {
        if self.handlers.contains_key(&task_type) {
            return Err(SpindleError::HandlerAlreadyRegistered(task_type));
        }
        let mut display_name = display_name.into();
        if display_name.is_empty() {
            display_name = task_type.default_name();
        }
        self.handlers.insert(
            task_type,
            Registration {
                display_name,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).map(|r| &r.handler)
    }

    /// Registered name, or `TaskType[n]` for unknown types.
    pub fn display_name(&self, task_type: TaskType) -> String {
        self.handlers
            .get(&task_type)
            .map(|r| r.display_name.clone())
            .unwrap_or_else(|| task_type.default_name())
    }

    /// Registered types in ascending order.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runtime executes a claimed `Task` by dispatching to its registered handler.
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
    deadline: Duration,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>, deadline: Duration) -> Self {
        Self { registry, deadline }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one task.
    ///
    /// The handler runs in its own tokio task, so a panic comes back as
    /// [`HandlerError::Panicked`]. When the deadline passes, `cancel` is
    /// cancelled and the handler is awaited (not aborted); the attempt is then
    /// reported as [`HandlerError::DeadlineExceeded`] whatever it returned.
    pub async fn execute(&self, task: Task, cancel: CancellationToken) -> Result<(), HandlerError> {
        let handler = self.registry.get(task.task_type).cloned().ok_or_else(|| {
            HandlerError::failed(format!("no handler for task_type={}", task.task_type))
        })?;

        let token = cancel.clone();
        let mut join = tokio::spawn(async move { handler.handle(token, &task).await });

        match tokio::time::timeout(self.deadline, &mut join).await {
            Ok(joined) => flatten(joined),
            Err(_elapsed) => {
                cancel.cancel();
                // 中断はしない。handler が戻るまで待つ
                let _ = join.await;
                Err(HandlerError::DeadlineExceeded(self.deadline))
            }
        }
    }
}

fn flatten(joined: Result<Result<(), HandlerError>, JoinError>) -> Result<(), HandlerError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(HandlerError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
