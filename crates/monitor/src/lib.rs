//! Task monitoring and global concurrency control
//!
//! The monitor is the authoritative task-state store: atomic task start with
//! content-level idempotency, idempotent terminal transitions, stats, and a
//! pub/sub event channel. Two backends exist — shared-store (Redis) for
//! fleet deployments and in-memory for single-process runs and tests — and
//! one is selected at startup by probing the shared store.
//!
//! The crate also hosts the global task limiter (shared sorted-set slots with
//! TTL, or a local semaphore) and the timeout sweeper.

pub mod limiter;
pub mod memory;
pub mod redis_store;
pub mod sweeper;

pub use limiter::{LimiterError, LocalTaskLimiter, RedisTaskLimiter, TaskLimiter, TaskSlot};
pub use memory::MemoryTaskMonitor;
pub use redis_store::RedisTaskMonitor;
pub use sweeper::TimeoutSweeper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use podcast_tts_config::Settings;
use podcast_tts_core::{ErrorKind, Strategy, TaskEvent, TaskRecord, TaskStatus};

/// Monitor errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("shared store error: {0}")]
    Store(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

impl From<redis::RedisError> for MonitorError {
    fn from(e: redis::RedisError) -> Self {
        MonitorError::Store(e.to_string())
    }
}

/// Outcome of an atomic task-start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    DuplicateContent { existing_text_id: String },
}

/// Aggregate counters answered by `get_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub active: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
    pub success_rate: f64,
    pub p50_duration_ms: i64,
    pub p95_duration_ms: i64,
}

/// Authoritative task-state store with an event channel.
///
/// All mutations commit to the backing store before the corresponding event is
/// published; a subscriber that reads state after receiving an event observes
/// at least the transitioned state.
#[async_trait]
pub trait TaskMonitor: Send + Sync {
    /// Atomically register a task as QUEUED.
    ///
    /// Returns `AlreadyRunning` if the same `text_id` is non-terminal, and
    /// `DuplicateContent` if another non-terminal task with the same
    /// `content_hash` started within the idempotency window.
    async fn start_task(
        &self,
        text_id: &str,
        content_hash: &str,
    ) -> Result<StartOutcome, MonitorError>;

    /// QUEUED -> PROCESSING. No-op on any other current status.
    async fn begin_processing(&self, text_id: &str) -> Result<(), MonitorError>;

    /// Record the chosen strategy and segment count.
    async fn record_strategy(
        &self,
        text_id: &str,
        strategy: Strategy,
        segment_count: u32,
    ) -> Result<(), MonitorError>;

    /// Update segment completion counters and publish a progress event.
    async fn record_progress(
        &self,
        text_id: &str,
        segments_completed: u32,
    ) -> Result<(), MonitorError>;

    /// Terminal transition to COMPLETED. Idempotent: returns the current
    /// status unchanged when the task is already terminal.
    async fn complete_task(
        &self,
        text_id: &str,
        audio_key: &str,
        audio_filename: &str,
        audio_url: &str,
    ) -> Result<TaskStatus, MonitorError>;

    /// Terminal transition to FAILED. Idempotent.
    async fn fail_task(
        &self,
        text_id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<TaskStatus, MonitorError>;

    /// Terminal transition to TIMEOUT. Idempotent.
    async fn timeout_task(&self, text_id: &str) -> Result<TaskStatus, MonitorError>;

    async fn get_task(&self, text_id: &str) -> Result<Option<TaskRecord>, MonitorError>;

    /// Tasks currently in PROCESSING, for the timeout sweeper.
    async fn list_processing(&self) -> Result<Vec<TaskRecord>, MonitorError>;

    async fn get_stats(&self) -> Result<MonitorStats, MonitorError>;

    /// Subscribe to the event channel. Events for all tasks flow through one
    /// channel; consumers filter by `text_id`.
    fn subscribe(&self) -> broadcast::Receiver<TaskEvent>;

    /// Sweep-leadership election. The in-memory backend always leads; the
    /// shared backend takes a short-TTL advisory lock.
    async fn try_lead_sweep(&self, holder: &str, ttl: Duration) -> Result<bool, MonitorError>;
}

/// Select the monitor backend by probing the shared store.
///
/// Selection is process-wide and never changes at runtime.
pub async fn select_monitor(settings: &Settings) -> Arc<dyn TaskMonitor> {
    match RedisTaskMonitor::connect(&settings.store, &settings.engine).await {
        Ok(monitor) => {
            tracing::info!(url = %settings.store.redis_url, "task monitor backed by shared store");
            Arc::new(monitor)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "shared store unavailable; using in-memory task monitor (single-process only)"
            );
            Arc::new(MemoryTaskMonitor::new(&settings.engine))
        }
    }
}

/// Select the limiter backend to match the monitor selection.
pub async fn select_limiter(settings: &Settings) -> Arc<dyn TaskLimiter> {
    match RedisTaskLimiter::connect(&settings.store, &settings.engine).await {
        Ok(limiter) => {
            tracing::info!("global limiter backed by shared store");
            Arc::new(limiter)
        }
        Err(e) => {
            tracing::warn!(error = %e, "shared store unavailable; using local semaphore limiter");
            Arc::new(LocalTaskLimiter::new(settings.engine.max_concurrent_tasks))
        }
    }
}

/// Percentile over a duration sample, nearest-rank.
pub(crate) fn percentile_ms(samples: &mut [i64], p: f64) -> i64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    let rank = ((p / 100.0) * samples.len() as f64).ceil() as usize;
    samples[rank.clamp(1, samples.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let mut samples = vec![100, 200, 300, 400, 500];
        assert_eq!(percentile_ms(&mut samples, 50.0), 300);
        assert_eq!(percentile_ms(&mut samples, 95.0), 500);

        let mut empty: Vec<i64> = Vec::new();
        assert_eq!(percentile_ms(&mut empty, 50.0), 0);

        let mut one = vec![42];
        assert_eq!(percentile_ms(&mut one, 95.0), 42);
    }
}
