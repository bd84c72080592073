//! ReaperLoop - 放置された Processing の回収
//!
//! A worker that crashes (or a process that dies) mid-task leaves its row in
//! Processing forever. The reaper periodically puts rows whose `update_time`
//! is older than the task timeout back to Pending so they run again.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ManagerConfig;
use crate::ports::{Clock, StoreError, TaskStore, sub_std};

pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    start_delay: Duration,
    interval: Duration,
    task_timeout: Duration,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, config: &ManagerConfig) -> Self {
        Self {
            store,
            clock,
            start_delay: config.query_interval(),
            interval: config.timeout_check_interval(),
            task_timeout: config.task_timeout(),
        }
    }

    /// Sleep `query_interval`, then sweep every `timeout_check_interval`
    /// until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval = ?self.interval,
            task_timeout = ?self.task_timeout,
            "reaper started"
        );

        let mut delay = self.start_delay;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            // エラーは sweep_once 内でログ済み
            let _ = self.sweep_once().await;
            delay = self.interval;
        }

        info!("reaper exited");
    }

    /// Reset every Processing row untouched for longer than the task timeout.
    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let stale_before = sub_std(now, self.task_timeout);
        match self
            .store
            .reset_stale_processing(None, stale_before, now)
            .await
        {
            Ok(0) => {
                debug!("reaper sweep found nothing stale");
                Ok(0)
            }
            Ok(n) => {
                info!(reset = n, stale_before = %stale_before, "reset stale processing tasks");
                Ok(n)
            }
            Err(e) => {
                error!(error = %e, "reaper sweep failed");
                Err(e)
            }
        }
    }
}
