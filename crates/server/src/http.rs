//! HTTP Endpoints
//!
//! REST API for the TTS task pipeline.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use podcast_tts_core::{Error, ErrorKind};
use podcast_tts_pipeline::{RetryOutcome, SubmitOutcome, SubmitRequest};
use podcast_tts_transport::WsSpeechProvider;

use crate::sse::stream_task;
use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        // Task endpoints
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/:text_id", get(get_task))
        .route("/api/tasks/:text_id/retry", post(retry_task))
        .route("/api/tasks/:text_id/stream", get(stream_task))

        // Operational endpoints
        .route("/api/stats", get(get_stats))
        .route("/api/diagnose/provider", get(diagnose_provider))

        // Health checks
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))

        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    if state.config.server.cors_enabled {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}

/// Map pipeline errors to user-visible responses.
fn error_response(e: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e.kind() {
        ErrorKind::Input => StatusCode::BAD_REQUEST,
        ErrorKind::TransientProvider => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "request failed");
    }
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        })),
    )
}

/// Submit a dialogue text for synthesis
async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> impl IntoResponse {
    let text_id = request.text_id.clone();
    match state.service.submit(request).await {
        Ok(SubmitOutcome::Accepted) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "accepted",
                "text_id": text_id,
            })),
        ),
        Ok(SubmitOutcome::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "already_running",
                "text_id": text_id,
            })),
        ),
        Ok(SubmitOutcome::DuplicateContent { existing_text_id }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "duplicate_content",
                "text_id": text_id,
                "existing_text_id": existing_text_id,
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// Retry a finished task
async fn retry_task(
    State(state): State<AppState>,
    Path(text_id): Path<String>,
) -> impl IntoResponse {
    match state.service.retry(&text_id).await {
        Ok(RetryOutcome::Accepted) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted", "text_id": text_id })),
        ),
        Ok(RetryOutcome::AudioExists) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "audio_exists", "text_id": text_id })),
        ),
        Ok(RetryOutcome::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "already_running", "text_id": text_id })),
        ),
        Ok(RetryOutcome::DuplicateContent { existing_text_id }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "duplicate_content",
                "text_id": text_id,
                "existing_text_id": existing_text_id,
            })),
        ),
        Ok(RetryOutcome::UnknownText) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown text", "text_id": text_id })),
        ),
        Err(e) => error_response(e),
    }
}

/// Read a task's current state
async fn get_task(
    State(state): State<AppState>,
    Path(text_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let task = state
        .monitor
        .get_task(&text_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "task read failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(serde_json::json!(task)))
}

/// Aggregate task statistics
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.stats().await {
        Ok(stats) => (StatusCode::OK, Json(serde_json::json!(stats))),
        Err(e) => error_response(e),
    }
}

/// Verify provider connectivity and credentials without synthesising
async fn diagnose_provider(State(state): State<AppState>) -> impl IntoResponse {
    let provider = WsSpeechProvider::new(state.config.provider.clone());
    match provider.probe().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "endpoint": state.config.provider.endpoint,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "success": false,
                "endpoint": state.config.provider.endpoint,
                "error": e.to_string(),
            })),
        ),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "active_tasks": stats.monitor.active,
            })),
        ),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use podcast_tts_config::Settings;
    use podcast_tts_core::{InputError, ProviderError, VoiceMap};
    use podcast_tts_monitor::{LocalTaskLimiter, MemoryTaskMonitor};
    use podcast_tts_persistence::{MemoryAudioStore, MemoryBlobStore, MemoryTextStore};
    use podcast_tts_pipeline::{TaskEngine, TaskService};

    fn test_state() -> AppState {
        let settings = Arc::new(Settings::default());
        let monitor = Arc::new(MemoryTaskMonitor::new(&settings.engine));
        let limiter = Arc::new(LocalTaskLimiter::new(settings.engine.max_concurrent_tasks));
        let blob = Arc::new(MemoryBlobStore::new());
        let audio_store = Arc::new(MemoryAudioStore::new());
        let text_store = Arc::new(MemoryTextStore::new());
        let provider = Arc::new(WsSpeechProvider::new(settings.provider.clone()));

        let engine = Arc::new(TaskEngine::new(
            provider,
            blob.clone(),
            audio_store.clone(),
            monitor.clone(),
            VoiceMap::new(settings.voices.clone()),
            settings.engine.clone(),
            settings.storage.public_read,
        ));
        let service = Arc::new(TaskService::new(
            engine,
            monitor,
            limiter,
            text_store,
            audio_store,
            blob,
            settings.engine.clone(),
            settings.storage.public_read,
        ));
        AppState::new(settings, service)
    }

    #[test]
    fn test_router_creation() {
        let _ = create_router(test_state());
    }

    #[test]
    fn test_error_mapping() {
        let (status, _) = error_response(InputError::EmptyInput.into());
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(ProviderError::Truncated.into());
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = error_response(Error::storage("put failed"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
