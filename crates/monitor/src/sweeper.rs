//! Timeout sweeper
//!
//! A periodic task that moves long-running PROCESSING tasks to TIMEOUT and
//! releases their limiter slots. In shared-store mode a single process leads
//! each sweep via a short-TTL advisory lock; in local mode every process
//! sweeps its own in-memory map. Timeout means "provider did not respond
//! within budget", which is distinct from failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use podcast_tts_core::epoch_ms;

use crate::{MonitorError, TaskLimiter, TaskMonitor, TaskSlot};

pub struct TimeoutSweeper {
    monitor: Arc<dyn TaskMonitor>,
    limiter: Arc<dyn TaskLimiter>,
    task_timeout: Duration,
    interval: Duration,
    holder: String,
}

impl TimeoutSweeper {
    pub fn new(
        monitor: Arc<dyn TaskMonitor>,
        limiter: Arc<dyn TaskLimiter>,
        task_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            monitor,
            limiter,
            task_timeout,
            interval,
            holder: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Run the sweep loop until the handle is dropped or aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.sweep_once().await {
                    Ok(0) => {}
                    Ok(swept) => tracing::info!(swept, "timed out stale tasks"),
                    Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
                }
            }
        })
    }

    /// One sweep pass. Returns how many tasks were transitioned.
    pub async fn sweep_once(&self) -> Result<usize, MonitorError> {
        // Lease twice the interval so leadership survives one missed tick.
        if !self
            .monitor
            .try_lead_sweep(&self.holder, self.interval * 2)
            .await?
        {
            return Ok(0);
        }

        let now = epoch_ms();
        let budget_ms = self.task_timeout.as_millis() as i64;
        let mut swept = 0;

        for task in self.monitor.list_processing().await? {
            if now - task.start_time_ms > budget_ms {
                tracing::warn!(
                    text_id = %task.text_id,
                    age_ms = now - task.start_time_ms,
                    "task exceeded processing budget"
                );
                self.monitor.timeout_task(&task.text_id).await?;
                // Slot tokens are text ids, so the sweeper can free the slot
                // of a task whose holder is gone.
                if let Err(e) = self
                    .limiter
                    .release(&TaskSlot::new(task.text_id.clone()))
                    .await
                {
                    tracing::warn!(text_id = %task.text_id, error = %e, "slot release failed");
                }
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalTaskLimiter, MemoryTaskMonitor, StartOutcome};
    use podcast_tts_config::EngineConfig;
    use podcast_tts_core::TaskStatus;

    #[tokio::test]
    async fn test_sweep_times_out_stale_processing_tasks() {
        let monitor = Arc::new(MemoryTaskMonitor::new(&EngineConfig::default()));
        let limiter = Arc::new(LocalTaskLimiter::new(2));

        assert_eq!(
            monitor.start_task("t-1", "h1").await.unwrap(),
            StartOutcome::Started
        );
        monitor.begin_processing("t-1").await.unwrap();

        // Zero budget: anything in PROCESSING is already stale.
        let sweeper = TimeoutSweeper::new(
            monitor.clone(),
            limiter,
            Duration::ZERO,
            Duration::from_secs(60),
        );
        // start_time is in the past relative to the sweep's `now` only if any
        // time elapsed; nudge the clock.
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(
            monitor.get_task("t-1").await.unwrap().unwrap().status,
            TaskStatus::Timeout
        );
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_tasks_alone() {
        let monitor = Arc::new(MemoryTaskMonitor::new(&EngineConfig::default()));
        let limiter = Arc::new(LocalTaskLimiter::new(2));

        monitor.start_task("t-1", "h1").await.unwrap();
        monitor.begin_processing("t-1").await.unwrap();

        let sweeper = TimeoutSweeper::new(
            monitor.clone(),
            limiter,
            Duration::from_secs(1800),
            Duration::from_secs(60),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
        assert_eq!(
            monitor.get_task("t-1").await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_sweep_ignores_queued_tasks() {
        let monitor = Arc::new(MemoryTaskMonitor::new(&EngineConfig::default()));
        let limiter = Arc::new(LocalTaskLimiter::new(2));

        monitor.start_task("t-1", "h1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeper = TimeoutSweeper::new(
            monitor.clone(),
            limiter,
            Duration::ZERO,
            Duration::from_secs(60),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
        assert_eq!(
            monitor.get_task("t-1").await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }
}
