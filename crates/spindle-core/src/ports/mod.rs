//! Ports: the seams to the outside world.
//!
//! - `TaskStore` / `TaskWriter`: durable task + history tables
//! - `Clock`: time source

pub mod clock;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock, add_std, sub_std, until};
pub use self::task_store::{StoreError, TaskStore, TaskWriter};
