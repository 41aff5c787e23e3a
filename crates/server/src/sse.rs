//! Server-push task progress streams
//!
//! One SSE subscription per `text_id`: the current state is emitted
//! immediately, then events are forwarded from the monitor's channel until a
//! terminal event or disconnect. The stream closes itself after the idle
//! ceiling; keepalives go out on the configured interval.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio::time::Instant;

use podcast_tts_core::{TaskEvent, TaskRecord};

use crate::state::AppState;

struct StreamCtx {
    rx: broadcast::Receiver<TaskEvent>,
    text_id: String,
    initial: Option<TaskRecord>,
    idle: Duration,
    deadline: Instant,
    done: bool,
}

/// SSE handler for `/api/tasks/:text_id/stream`.
pub async fn stream_task(
    State(state): State<AppState>,
    Path(text_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before the initial read so no transition falls in the gap.
    let rx = state.monitor.subscribe();
    let initial = state.monitor.get_task(&text_id).await.ok().flatten();

    let idle = state.config.server.stream_idle();
    let keepalive = state.config.server.stream_keepalive();

    let ctx = StreamCtx {
        rx,
        text_id,
        initial,
        idle,
        deadline: Instant::now() + idle,
        done: false,
    };

    let stream = futures::stream::unfold(ctx, |mut ctx| async move {
        if ctx.done {
            return None;
        }

        // Late subscribers get the current state first; events are not
        // replayed.
        if let Some(record) = ctx.initial.take() {
            if record.status.is_terminal() {
                ctx.done = true;
            }
            let event = Event::default().json_data(&record).ok()?;
            return Some((Ok::<_, Infallible>(event), ctx));
        }

        loop {
            let remaining = ctx.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, ctx.rx.recv()).await {
                // Idle ceiling reached.
                Err(_) => return None,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(
                        text_id = %ctx.text_id,
                        skipped,
                        "subscriber lagged behind event channel"
                    );
                    continue;
                }
                Ok(Ok(event)) if event.text_id == ctx.text_id => {
                    ctx.deadline = Instant::now() + ctx.idle;
                    if event.is_terminal() {
                        ctx.done = true;
                    }
                    let sse_event = Event::default().json_data(&event).ok()?;
                    return Some((Ok(sse_event), ctx));
                }
                // Another task's event; keep waiting.
                Ok(Ok(_)) => continue,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text("keepalive"))
}
