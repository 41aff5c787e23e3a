//! Dialogue TTS Server
//!
//! HTTP surface over the task pipeline: submission, retry, status reads,
//! live progress streams, stats, and diagnostics.

pub mod http;
pub mod sse;
pub mod state;

pub use http::create_router;
pub use state::AppState;
