//! Task orchestration pipeline
//!
//! This crate turns a submitted dialogue text into one uploaded audio
//! artifact:
//! - Dialogue parsing and segmentation
//! - Segment workers with bounded retries over fresh provider sessions
//! - The task engine: strategy selection, bounded parallel batches, in-order
//!   concatenation, upload, and terminal monitor transitions
//! - The submission service gating everything behind the global limiter and
//!   the monitor's idempotency checks

pub mod engine;
pub mod parser;
pub mod service;
pub mod worker;

pub use engine::{EngineOutput, TaskEngine};
pub use parser::{segment_turns, DialogueParser};
pub use service::{
    content_hash, ActiveTask, RetryOutcome, ServiceStats, SubmitOutcome, SubmitRequest,
    TaskService,
};
pub use worker::SegmentWorker;
