//! Impls - TaskStore の実装
//!
//! - **MemoryTaskStore**: プロセス内の正本（テスト・開発用）
//! - **SqliteTaskStore**: rusqlite ベースの永続ストア

#[cfg(test)]
pub(crate) mod faulty_store;
pub mod memory_store;
pub mod sqlite_store;

pub use self::memory_store::MemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
