//! App - アプリケーション層
//!
//! ports を組み合わせてキューの動作を実装します。
//!
//! # 主要コンポーネント
//! - **Manager**: 登録・起動・停止・投入・結果参照
//! - **WorkerLoop**: タスク種別ごとの実行ループ（claim→handle→commit→history）
//! - **ReaperLoop**: 放置された Processing の回収
//! - **TaskResult**: 結果参照のビュー

pub mod manager;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

pub use self::manager::Manager;
pub use self::reaper_loop::ReaperLoop;
pub use self::status::TaskResult;
pub use self::worker_loop::{Iteration, Polled, WorkerLoop};
