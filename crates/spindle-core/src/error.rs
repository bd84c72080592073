use thiserror::Error;

use crate::domain::TaskType;
use crate::ports::StoreError;

/// Errors returned synchronously by the manager API.
///
/// Handler failures never show up here; they are recorded on the task.
#[derive(Debug, Error)]
pub enum SpindleError {
    #[error("handler already registered for task_type={0}")]
    HandlerAlreadyRegistered(TaskType),

    #[error("manager is closed")]
    ManagerClosed,

    #[error("manager already started")]
    AlreadyStarted,

    #[error("no handlers registered")]
    NoHandlers,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
