use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::info;

use spindle_core::observability::init_tracing;
use spindle_core::ports::StoreError;
use spindle_core::{
    HandlerError, Manager, ManagerConfig, SpindleError, SqliteTaskStore, Task, TaskHandler,
    TaskType,
};

const HELLO: TaskType = TaskType::new(1);

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for HelloHandler {
    async fn handle(&self, _cancel: CancellationToken, task: &Task) -> Result<(), HandlerError> {
        let p: HelloPayload = task.content_json()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failed(format!(
                "intentional failure (left={left})"
            )));
        }

        println!("Hello, {}!", p.name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // (A) Store と Manager を用意（デモなので間隔は短め）
    let store = Arc::new(SqliteTaskStore::open_in_memory()?);
    let config = ManagerConfig {
        init_interval_ms: 100,
        query_interval_ms: 1_000,
        backoff_intervals_ms: vec![200, 300, 500],
        ..ManagerConfig::default()
    };
    let manager = Manager::new(config, store.clone())?;
    manager.register_handler(HELLO, "hello", Arc::new(HelloHandler::new(2)))?;

    // (B) worker と reaper を起動
    manager.start().await?;

    // (C) 業務データと同じトランザクションでタスク投入
    let payload = serde_json::to_vec(&serde_json::json!({ "name": "spindle" }))?;
    let id = store.with_connection(|conn| -> Result<_, SpindleError> {
        let tx = conn.transaction().map_err(StoreError::from)?;
        tx.execute_batch("CREATE TABLE IF NOT EXISTS greeting (name TEXT NOT NULL)")
            .map_err(StoreError::from)?;
        tx.execute("INSERT INTO greeting (name) VALUES (?1)", ["spindle"])
            .map_err(StoreError::from)?;
        let id = manager.add_task(&tx, HELLO, "greeting-1", payload)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(id)
    })?;
    manager.wake_up(HELLO);
    info!(task_id = %id, "enqueued");

    // (D) 完了をポーリングで待つ
    loop {
        if let Some(result) = manager.get_task_result("greeting-1").await? {
            if result.is_done() {
                println!("{}", serde_json::to_string_pretty(&result.history)?);
                println!(
                    "final status: {} after {} attempt(s)",
                    result.status().label(),
                    result.history.len()
                );
                break;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }

    // (E) graceful shutdown
    manager.stop().await;
    Ok(())
}
