//! Domain model (IDs, task rows, history rows, outcomes, handler errors).

pub mod errors;
pub mod history;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use self::errors::HandlerError;
pub use self::history::{NewHistory, SUCCESS_RESULT, TaskHistory};
pub use self::ids::{TaskId, TaskType};
pub use self::outcome::Outcome;
pub use self::state::TaskStatus;
pub use self::task::{NewTask, Task};
