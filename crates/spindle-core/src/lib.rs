//! spindle-core
//!
//! A database-backed, at-least-once task queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, history, outcome, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, TaskWriter, Clock）
//! - **impls**: TaskStore の実装（MemoryTaskStore, SqliteTaskStore）
//! - **queue**: リトライポリシーと wake シグナル
//! - **runtime**: handler registry と実行（deadline, panic 捕捉）
//! - **app**: Manager, WorkerLoop, ReaperLoop, TaskResult
//! - config / error / observability

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod runtime;

pub use app::{Manager, TaskResult};
pub use config::ManagerConfig;
pub use domain::{HandlerError, Task, TaskId, TaskStatus, TaskType};
pub use error::SpindleError;
pub use impls::{MemoryTaskStore, SqliteTaskStore};
pub use ports::{Clock, FixedClock, StoreError, SystemClock, TaskStore, TaskWriter};
pub use runtime::{FnHandler, TaskHandler};
