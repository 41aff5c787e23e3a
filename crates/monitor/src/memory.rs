//! In-memory task monitor
//!
//! Reserved for single-process deployments and tests. A single mutex guards
//! all state, so the check-and-set in `start_task` is atomic by construction.
//! Counters reset with the process; fleet deployments use the shared backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use podcast_tts_config::EngineConfig;
use podcast_tts_core::{
    epoch_ms, ErrorKind, Strategy, TaskEvent, TaskRecord, TaskStatus,
};

use crate::{MonitorError, MonitorStats, StartOutcome, TaskMonitor};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DURATION_SAMPLE_CAP: usize = 1000;

struct IdemEntry {
    text_id: String,
    registered_at_ms: i64,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskRecord>,
    idempotency: HashMap<String, IdemEntry>,
    completed: u64,
    failed: u64,
    timeout: u64,
    durations_ms: Vec<i64>,
}

pub struct MemoryTaskMonitor {
    inner: Mutex<Inner>,
    events: broadcast::Sender<TaskEvent>,
    idempotency_ttl_ms: i64,
    terminal_retention_ms: i64,
}

impl MemoryTaskMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            idempotency_ttl_ms: config.idempotency_ttl_seconds as i64 * 1000,
            terminal_retention_ms: config.terminal_retention_seconds as i64 * 1000,
        }
    }

    fn publish(&self, event: TaskEvent) {
        // Nobody listening is fine; SSE subscribers come and go.
        let _ = self.events.send(event);
    }

    /// Drop terminal tasks past retention and stale idempotency entries.
    fn evict_expired(inner: &mut Inner, now_ms: i64, retention_ms: i64, idem_ttl_ms: i64) {
        inner.tasks.retain(|_, task| {
            !(task.status.is_terminal()
                && task
                    .end_time_ms
                    .is_some_and(|end| now_ms - end > retention_ms))
        });
        inner
            .idempotency
            .retain(|_, entry| now_ms - entry.registered_at_ms <= idem_ttl_ms);
    }
}

#[async_trait]
impl TaskMonitor for MemoryTaskMonitor {
    async fn start_task(
        &self,
        text_id: &str,
        content_hash: &str,
    ) -> Result<StartOutcome, MonitorError> {
        let now = epoch_ms();
        let event = {
            let mut inner = self.inner.lock();
            Self::evict_expired(
                &mut inner,
                now,
                self.terminal_retention_ms,
                self.idempotency_ttl_ms,
            );

            if let Some(entry) = inner.idempotency.get(content_hash) {
                let holder_active = inner
                    .tasks
                    .get(&entry.text_id)
                    .is_some_and(|t| !t.status.is_terminal());
                if holder_active {
                    if entry.text_id == text_id {
                        return Ok(StartOutcome::AlreadyRunning);
                    }
                    return Ok(StartOutcome::DuplicateContent {
                        existing_text_id: entry.text_id.clone(),
                    });
                }
            }

            if inner
                .tasks
                .get(text_id)
                .is_some_and(|t| !t.status.is_terminal())
            {
                return Ok(StartOutcome::AlreadyRunning);
            }

            inner
                .tasks
                .insert(text_id.to_string(), TaskRecord::new(text_id, content_hash, now));
            inner.idempotency.insert(
                content_hash.to_string(),
                IdemEntry {
                    text_id: text_id.to_string(),
                    registered_at_ms: now,
                },
            );

            TaskEvent::queued(text_id, now)
        };

        self.publish(event);
        Ok(StartOutcome::Started)
    }

    async fn begin_processing(&self, text_id: &str) -> Result<(), MonitorError> {
        let now = epoch_ms();
        let event = {
            let mut inner = self.inner.lock();
            let task = inner
                .tasks
                .get_mut(text_id)
                .ok_or_else(|| MonitorError::NotFound(text_id.to_string()))?;
            if task.status != TaskStatus::Queued {
                return Ok(());
            }
            task.status = TaskStatus::Processing;
            TaskEvent::started(text_id, now)
        };
        self.publish(event);
        Ok(())
    }

    async fn record_strategy(
        &self,
        text_id: &str,
        strategy: Strategy,
        segment_count: u32,
    ) -> Result<(), MonitorError> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(text_id)
            .ok_or_else(|| MonitorError::NotFound(text_id.to_string()))?;
        task.strategy = Some(strategy);
        task.segment_count = segment_count;
        Ok(())
    }

    async fn record_progress(
        &self,
        text_id: &str,
        segments_completed: u32,
    ) -> Result<(), MonitorError> {
        let now = epoch_ms();
        let event = {
            let mut inner = self.inner.lock();
            let task = inner
                .tasks
                .get_mut(text_id)
                .ok_or_else(|| MonitorError::NotFound(text_id.to_string()))?;
            if task.status.is_terminal() {
                return Ok(());
            }
            task.segments_completed = segments_completed.min(task.segment_count);
            TaskEvent::progress(text_id, task.segments_completed, task.segment_count, now)
        };
        self.publish(event);
        Ok(())
    }

    async fn complete_task(
        &self,
        text_id: &str,
        audio_key: &str,
        audio_filename: &str,
        audio_url: &str,
    ) -> Result<TaskStatus, MonitorError> {
        let now = epoch_ms();
        let event = {
            let mut inner = self.inner.lock();
            let task = inner
                .tasks
                .get_mut(text_id)
                .ok_or_else(|| MonitorError::NotFound(text_id.to_string()))?;
            if task.status.is_terminal() {
                return Ok(task.status);
            }
            task.status = TaskStatus::Completed;
            task.end_time_ms = Some(now);
            task.audio_key = Some(audio_key.to_string());
            task.audio_filename = Some(audio_filename.to_string());
            task.segments_completed = task.segment_count;
            let duration = task.duration_ms().unwrap_or(0);

            inner.completed += 1;
            inner.durations_ms.push(duration);
            if inner.durations_ms.len() > DURATION_SAMPLE_CAP {
                inner.durations_ms.remove(0);
            }
            TaskEvent::completed(text_id, audio_url, now)
        };
        self.publish(event);
        Ok(TaskStatus::Completed)
    }

    async fn fail_task(
        &self,
        text_id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<TaskStatus, MonitorError> {
        let now = epoch_ms();
        let event = {
            let mut inner = self.inner.lock();
            let task = inner
                .tasks
                .get_mut(text_id)
                .ok_or_else(|| MonitorError::NotFound(text_id.to_string()))?;
            if task.status.is_terminal() {
                return Ok(task.status);
            }
            task.status = TaskStatus::Failed;
            task.end_time_ms = Some(now);
            task.error_kind = Some(kind);
            task.error_message = Some(message.to_string());
            let duration = task.duration_ms().unwrap_or(0);

            inner.failed += 1;
            inner.durations_ms.push(duration);
            if inner.durations_ms.len() > DURATION_SAMPLE_CAP {
                inner.durations_ms.remove(0);
            }
            TaskEvent::failed(text_id, kind, message, now)
        };
        self.publish(event);
        Ok(TaskStatus::Failed)
    }

    async fn timeout_task(&self, text_id: &str) -> Result<TaskStatus, MonitorError> {
        let now = epoch_ms();
        let event = {
            let mut inner = self.inner.lock();
            let task = inner
                .tasks
                .get_mut(text_id)
                .ok_or_else(|| MonitorError::NotFound(text_id.to_string()))?;
            if task.status.is_terminal() {
                return Ok(task.status);
            }
            task.status = TaskStatus::Timeout;
            task.end_time_ms = Some(now);
            task.error_kind = Some(ErrorKind::Internal);
            task.error_message = Some("task exceeded its processing budget".to_string());

            inner.timeout += 1;
            TaskEvent::timed_out(text_id, now)
        };
        self.publish(event);
        Ok(TaskStatus::Timeout)
    }

    async fn get_task(&self, text_id: &str) -> Result<Option<TaskRecord>, MonitorError> {
        Ok(self.inner.lock().tasks.get(text_id).cloned())
    }

    async fn list_processing(&self) -> Result<Vec<TaskRecord>, MonitorError> {
        Ok(self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .cloned()
            .collect())
    }

    async fn get_stats(&self) -> Result<MonitorStats, MonitorError> {
        let inner = self.inner.lock();
        let active = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .count() as u64;
        let queued = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count() as u64;

        let finished = inner.completed + inner.failed + inner.timeout;
        let success_rate = if finished > 0 {
            inner.completed as f64 / finished as f64
        } else {
            0.0
        };

        let mut samples = inner.durations_ms.clone();
        Ok(MonitorStats {
            active,
            queued,
            completed: inner.completed,
            failed: inner.failed,
            timeout: inner.timeout,
            success_rate,
            p50_duration_ms: crate::percentile_ms(&mut samples, 50.0),
            p95_duration_ms: crate::percentile_ms(&mut samples, 95.0),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn try_lead_sweep(&self, _holder: &str, _ttl: Duration) -> Result<bool, MonitorError> {
        // Every process sweeps its own in-memory map.
        Ok(true)
    }
}
