//! Core types for the dialogue TTS service
//!
//! This crate provides foundational types used across all other crates:
//! - Dialogue turns and segments
//! - Task records, statuses, and progress events
//! - Error types and the failure-kind taxonomy

pub mod dialogue;
pub mod error;
pub mod task;

pub use dialogue::{DialogueTurn, Segment, VoiceMap};
pub use error::{Error, ErrorKind, InputError, ProviderError, Result};
pub use task::{EventKind, Progress, Strategy, TaskEvent, TaskRecord, TaskStatus};

/// Current wall-clock time as epoch milliseconds.
///
/// Task records persist epoch-ms timestamps so they are comparable across
/// processes; durations within one process are still measured with `Instant`.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
