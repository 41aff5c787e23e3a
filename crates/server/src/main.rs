//! Dialogue TTS Server Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use podcast_tts_config::{load_settings, Settings};
use podcast_tts_core::VoiceMap;
use podcast_tts_monitor::{select_limiter, select_monitor, TimeoutSweeper};
use podcast_tts_persistence::{FsBlobStore, MemoryAudioStore, MemoryTextStore};
use podcast_tts_pipeline::{TaskEngine, TaskService};
use podcast_tts_server::{create_router, AppState};
use podcast_tts_transport::WsSpeechProvider;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = std::env::var("PODCAST_TTS_ENV").ok();
    let config = load_settings(env.as_deref())?;

    init_tracing(&config);

    tracing::info!("Starting dialogue TTS server v{}", env!("CARGO_PKG_VERSION"));

    // Backend selection happens once, at startup, by probing the shared
    // store; both the monitor and the limiter fall back to in-process
    // implementations together.
    let monitor = select_monitor(&config).await;
    let limiter = select_limiter(&config).await;

    let blob = Arc::new(FsBlobStore::new(
        config.storage.root.clone(),
        config.storage.public_base_url.clone(),
    ));
    let text_store = Arc::new(MemoryTextStore::new());
    let audio_store = Arc::new(MemoryAudioStore::new());
    tracing::warn!(
        "row stores are in-memory and single-process-only; text/audio records \
         (including the one-live-audio-per-text constraint and retry \
         idempotency) do not survive restarts and are not shared across \
         replicas"
    );
    let provider = Arc::new(WsSpeechProvider::new(config.provider.clone()));

    let engine = Arc::new(TaskEngine::new(
        provider,
        blob.clone(),
        audio_store.clone(),
        monitor.clone(),
        VoiceMap::new(config.voices.clone()),
        config.engine.clone(),
        config.storage.public_read,
    ));
    let service = Arc::new(TaskService::new(
        engine,
        monitor.clone(),
        limiter.clone(),
        text_store,
        audio_store,
        blob,
        config.engine.clone(),
        config.storage.public_read,
    ));

    let sweeper = TimeoutSweeper::new(
        monitor,
        limiter,
        config.engine.task_timeout(),
        config.engine.sweep_interval(),
    );
    let sweeper_handle = sweeper.spawn();
    tracing::info!("Timeout sweeper running");

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let state = AppState::new(Arc::new(config), service);
    let app = create_router(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper_handle.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        format!("podcast_tts={level},tower_http=info").into()
    });

    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
