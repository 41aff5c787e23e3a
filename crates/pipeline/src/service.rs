//! Submission service
//!
//! The public entry point for task creation. Bundles input validation, text
//! persistence, the monitor's idempotency check, global slot acquisition with
//! lease renewal, and the scoped slot release around the engine run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use podcast_tts_config::EngineConfig;
use podcast_tts_core::{epoch_ms, Error, ErrorKind, InputError, Result, TaskStatus};
use podcast_tts_monitor::{
    LimiterError, MonitorError, MonitorStats, StartOutcome, TaskLimiter, TaskMonitor,
};
use podcast_tts_persistence::{
    text_object_key, AudioStore, BlobStore, PersistenceError, TextRow, TextStore,
};

use crate::engine::TaskEngine;

/// Hex SHA-256 of the submitted text; the idempotency key.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Submission payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub text_id: String,
    pub text: String,
    pub user_id: String,
    /// Display title; defaults to the text id.
    #[serde(default)]
    pub title: Option<String>,
    /// Original filename; defaults to `{title}.txt`.
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    AlreadyRunning,
    DuplicateContent { existing_text_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// A live audio already exists; nothing to do.
    AudioExists,
    AlreadyRunning,
    UnknownText,
    DuplicateContent { existing_text_id: String },
    Accepted,
}

/// One row of the stats endpoint's active-task listing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTask {
    pub text_id: String,
    pub status: TaskStatus,
    pub start_time_ms: i64,
    pub age_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    #[serde(flatten)]
    pub monitor: MonitorStats,
    /// Configured limiter ceiling.
    pub max_concurrent: usize,
    /// Live audio rows in the persistence layer; the durable completion
    /// count that survives restarts.
    pub live_audio_rows: u64,
    pub active_list: Vec<ActiveTask>,
}

pub struct TaskService {
    engine: Arc<TaskEngine>,
    monitor: Arc<dyn TaskMonitor>,
    limiter: Arc<dyn TaskLimiter>,
    text_store: Arc<dyn TextStore>,
    audio_store: Arc<dyn AudioStore>,
    blob: Arc<dyn BlobStore>,
    config: EngineConfig,
    public_read: bool,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<TaskEngine>,
        monitor: Arc<dyn TaskMonitor>,
        limiter: Arc<dyn TaskLimiter>,
        text_store: Arc<dyn TextStore>,
        audio_store: Arc<dyn AudioStore>,
        blob: Arc<dyn BlobStore>,
        config: EngineConfig,
        public_read: bool,
    ) -> Self {
        Self {
            engine,
            monitor,
            limiter,
            text_store,
            audio_store,
            blob,
            config,
            public_read,
        }
    }

    pub fn monitor(&self) -> Arc<dyn TaskMonitor> {
        self.monitor.clone()
    }

    /// Accept a submission: validate, persist the text, register the task,
    /// and dispatch the engine in the background.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitOutcome> {
        if req.text.trim().is_empty() {
            return Err(InputError::EmptyInput.into());
        }
        let char_count = req.text.chars().count();
        if char_count > self.config.max_text_length {
            return Err(InputError::OversizedText {
                len: char_count,
                max: self.config.max_text_length,
            }
            .into());
        }

        let title = req.title.clone().unwrap_or_else(|| req.text_id.clone());
        let filename = req
            .filename
            .clone()
            .unwrap_or_else(|| format!("{title}.txt"));

        self.ensure_text_persisted(&req, &title, &filename, char_count)
            .await?;

        let hash = content_hash(&req.text);
        match self
            .monitor
            .start_task(&req.text_id, &hash)
            .await
            .map_err(monitor_error)?
        {
            StartOutcome::Started => {
                tracing::info!(text_id = %req.text_id, char_count, "task accepted");
                self.spawn_run(req.text_id, req.text, req.user_id, title);
                Ok(SubmitOutcome::Accepted)
            }
            StartOutcome::AlreadyRunning => Ok(SubmitOutcome::AlreadyRunning),
            StartOutcome::DuplicateContent { existing_text_id } => {
                tracing::info!(
                    text_id = %req.text_id,
                    existing_text_id = %existing_text_id,
                    "duplicate content suppressed"
                );
                Ok(SubmitOutcome::DuplicateContent { existing_text_id })
            }
        }
    }

    /// Retry entry: no-op when audio exists, rejected while a task is in
    /// flight, otherwise dispatches a fresh run from the stored text.
    pub async fn retry(&self, text_id: &str) -> Result<RetryOutcome> {
        if self
            .audio_store
            .live_for_text(text_id)
            .await
            .map_err(storage_error)?
            .is_some()
        {
            return Ok(RetryOutcome::AudioExists);
        }

        if let Some(task) = self.monitor.get_task(text_id).await.map_err(monitor_error)? {
            if !task.status.is_terminal() {
                return Ok(RetryOutcome::AlreadyRunning);
            }
        }

        let Some(row) = self.text_store.get(text_id).await.map_err(storage_error)? else {
            return Ok(RetryOutcome::UnknownText);
        };

        match self
            .monitor
            .start_task(text_id, &content_hash(&row.content))
            .await
            .map_err(monitor_error)?
        {
            StartOutcome::Started => {
                tracing::info!(text_id, "task retry accepted");
                self.spawn_run(text_id.to_string(), row.content, row.user_id, row.title);
                Ok(RetryOutcome::Accepted)
            }
            StartOutcome::AlreadyRunning => Ok(RetryOutcome::AlreadyRunning),
            StartOutcome::DuplicateContent { existing_text_id } => {
                Ok(RetryOutcome::DuplicateContent { existing_text_id })
            }
        }
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let monitor = self.monitor.get_stats().await.map_err(monitor_error)?;
        let now = epoch_ms();
        let active_list = self
            .monitor
            .list_processing()
            .await
            .map_err(monitor_error)?
            .into_iter()
            .map(|t| ActiveTask {
                age_ms: (now - t.start_time_ms).max(0),
                text_id: t.text_id,
                status: t.status,
                start_time_ms: t.start_time_ms,
            })
            .collect();
        let live_audio_rows = self.audio_store.count_live().await.map_err(storage_error)?;

        Ok(ServiceStats {
            monitor,
            max_concurrent: self.limiter.capacity(),
            live_audio_rows,
            active_list,
        })
    }

    async fn ensure_text_persisted(
        &self,
        req: &SubmitRequest,
        title: &str,
        filename: &str,
        char_count: usize,
    ) -> Result<()> {
        if self
            .text_store
            .get(&req.text_id)
            .await
            .map_err(storage_error)?
            .is_some()
        {
            return Ok(());
        }

        let object_key = text_object_key(chrono::Utc::now(), filename);
        self.blob
            .put(
                &object_key,
                req.text.as_bytes(),
                "text/plain; charset=utf-8",
                self.public_read,
            )
            .await
            .map_err(storage_error)?;

        self.text_store
            .insert(TextRow {
                text_id: req.text_id.clone(),
                user_id: req.user_id.clone(),
                filename: filename.to_string(),
                title: title.to_string(),
                content: req.text.clone(),
                char_count,
                object_key,
                created_at_ms: epoch_ms(),
                is_deleted: false,
            })
            .await
            .map_err(storage_error)
    }

    fn spawn_run(&self, text_id: String, text: String, user_id: String, title: String) {
        let engine = self.engine.clone();
        let monitor = self.monitor.clone();
        let limiter = self.limiter.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            Self::run_task(engine, monitor, limiter, config, text_id, text, user_id, title).await;
        });
    }

    /// Drive one task: slot acquire, lease renewal, engine run, terminal
    /// transition. The slot is released exactly once on every exit path past
    /// acquisition.
    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        engine: Arc<TaskEngine>,
        monitor: Arc<dyn TaskMonitor>,
        limiter: Arc<dyn TaskLimiter>,
        config: EngineConfig,
        text_id: String,
        text: String,
        user_id: String,
        title: String,
    ) {
        let slot = match limiter.acquire(&text_id, config.task_timeout()).await {
            Ok(slot) => slot,
            Err(LimiterError::Busy) => {
                tracing::warn!(text_id = %text_id, "no concurrency slot within wait budget");
                let _ = monitor
                    .fail_task(
                        &text_id,
                        ErrorKind::Internal,
                        "no concurrency slot within wait budget",
                    )
                    .await;
                return;
            }
            Err(e) => {
                let _ = monitor
                    .fail_task(&text_id, ErrorKind::Internal, &format!("limiter: {e}"))
                    .await;
                return;
            }
        };

        let renewal = {
            let limiter = limiter.clone();
            let slot = slot.clone();
            let text_id = text_id.clone();
            let every = config.slot_renew();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    if let Err(e) = limiter.renew(&slot).await {
                        tracing::warn!(text_id = %text_id, error = %e, "slot renewal failed");
                    }
                }
            })
        };

        let result = match monitor.begin_processing(&text_id).await {
            Ok(()) => engine
                .execute(&text_id, &text, &user_id, &title)
                .await
                .map(|_| ()),
            Err(e) => Err(Error::internal(format!("monitor: {e}"))),
        };

        renewal.abort();

        if let Err(e) = result {
            tracing::warn!(text_id = %text_id, error = %e, kind = %e.kind(), "task failed");
            let _ = monitor.fail_task(&text_id, e.kind(), &e.to_string()).await;
        }

        if let Err(e) = limiter.release(&slot).await {
            tracing::warn!(text_id = %text_id, error = %e, "slot release failed");
        }
    }
}

fn monitor_error(e: MonitorError) -> Error {
    Error::internal(format!("monitor: {e}"))
}

fn storage_error(e: PersistenceError) -> Error {
    Error::storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_deterministic() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }
}
