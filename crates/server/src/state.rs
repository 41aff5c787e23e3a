//! Application State
//!
//! Shared state across all handlers.

use std::sync::Arc;

use podcast_tts_config::Settings;
use podcast_tts_monitor::TaskMonitor;
use podcast_tts_pipeline::TaskService;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration
    pub config: Arc<Settings>,
    /// Submission service
    pub service: Arc<TaskService>,
    /// Task monitor (status reads and event subscriptions)
    pub monitor: Arc<dyn TaskMonitor>,
}

impl AppState {
    pub fn new(config: Arc<Settings>, service: Arc<TaskService>) -> Self {
        let monitor = service.monitor();
        Self {
            config,
            service,
            monitor,
        }
    }
}
