//! Task records, lifecycle statuses, and progress events

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Task lifecycle status.
///
/// Transitions are monotonic: `Queued -> Processing -> (Completed | Failed |
/// Timeout)`. Terminal transitions are idempotent at the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "timeout" => Some(TaskStatus::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synthesis strategy chosen by the task engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Serial,
    Parallel,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Serial => "serial",
            Strategy::Parallel => "parallel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "serial" => Some(Strategy::Serial),
            "parallel" => Some(Strategy::Parallel),
            _ => None,
        }
    }
}

/// Authoritative per-task state held by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub text_id: String,
    pub content_hash: String,
    pub status: TaskStatus,
    /// Epoch ms at task registration.
    pub start_time_ms: i64,
    /// Epoch ms at terminal transition.
    pub end_time_ms: Option<i64>,
    pub audio_key: Option<String>,
    pub audio_filename: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub strategy: Option<Strategy>,
    pub segment_count: u32,
    pub segments_completed: u32,
}

impl TaskRecord {
    pub fn new(text_id: impl Into<String>, content_hash: impl Into<String>, now_ms: i64) -> Self {
        Self {
            text_id: text_id.into(),
            content_hash: content_hash.into(),
            status: TaskStatus::Queued,
            start_time_ms: now_ms,
            end_time_ms: None,
            audio_key: None,
            audio_filename: None,
            error_kind: None,
            error_message: None,
            strategy: None,
            segment_count: 0,
            segments_completed: 0,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time_ms.map(|end| (end - self.start_time_ms).max(0))
    }
}

/// Event kinds published on the monitor's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Timeout,
}

/// Segment completion counters carried on progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

/// One event on a task's channel, pushed to subscribers as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub text_id: String,
    #[serde(rename = "type")]
    pub event: EventKind,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

impl TaskEvent {
    fn base(text_id: &str, event: EventKind, status: TaskStatus, now_ms: i64) -> Self {
        Self {
            text_id: text_id.to_string(),
            event,
            status,
            progress: None,
            audio_url: None,
            error: None,
            timestamp_ms: now_ms,
        }
    }

    pub fn queued(text_id: &str, now_ms: i64) -> Self {
        Self::base(text_id, EventKind::Queued, TaskStatus::Queued, now_ms)
    }

    pub fn started(text_id: &str, now_ms: i64) -> Self {
        Self::base(text_id, EventKind::Started, TaskStatus::Processing, now_ms)
    }

    pub fn progress(text_id: &str, completed: u32, total: u32, now_ms: i64) -> Self {
        let mut event = Self::base(text_id, EventKind::Progress, TaskStatus::Processing, now_ms);
        event.progress = Some(Progress { completed, total });
        event
    }

    pub fn completed(text_id: &str, audio_url: impl Into<String>, now_ms: i64) -> Self {
        let mut event = Self::base(text_id, EventKind::Completed, TaskStatus::Completed, now_ms);
        event.audio_url = Some(audio_url.into());
        event
    }

    pub fn failed(text_id: &str, kind: ErrorKind, message: &str, now_ms: i64) -> Self {
        let mut event = Self::base(text_id, EventKind::Failed, TaskStatus::Failed, now_ms);
        event.error = Some(format!("{kind}: {message}"));
        event
    }

    pub fn timed_out(text_id: &str, now_ms: i64) -> Self {
        let mut event = Self::base(text_id, EventKind::Timeout, TaskStatus::Timeout, now_ms);
        event.error = Some("task exceeded its processing budget".to_string());
        event
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert!(TaskStatus::parse("pending").is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = TaskEvent::progress("t-1", 2, 5, 1_000);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["status"], "processing");
        assert_eq!(json["progress"]["completed"], 2);
        assert!(json.get("audio_url").is_none());
    }

    #[test]
    fn test_record_duration() {
        let mut record = TaskRecord::new("t-1", "hash", 1_000);
        assert_eq!(record.duration_ms(), None);
        record.end_time_ms = Some(4_500);
        assert_eq!(record.duration_ms(), Some(3_500));
    }
}
