use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use boardroom_core::GameError;

use crate::error::AppError;
use crate::queue::QueuedEvent;
use crate::state::{AppState, ConnectionGuard};

/// GET /api/v1/events/stream: the event queue as server-sent events.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let max_sse = state.config.limits.max_sse_subscribers;
    let current = state.sse_subscriber_count.load(Ordering::Relaxed);
    if current >= max_sse {
        tracing::warn!(current, max = max_sse, "SSE subscriber limit reached");
        return Err(
            GameError::ResourceExhausted("event stream subscriber limit reached".into()).into(),
        );
    }

    let guard = ConnectionGuard::new(Arc::clone(&state.sse_subscriber_count));
    let rx = state.queue.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result: Result<QueuedEvent, _>| {
        let _guard = &guard;
        match result {
            Ok(event) => to_sse(&event),
            Err(e) => {
                tracing::warn!("SSE broadcast receive error: {e}");
                None
            },
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &QueuedEvent) -> Option<Result<SseEvent, Infallible>> {
    let kind = serde_json::to_value(event.kind)
        .ok()
        .and_then(|v| v.as_str().map(String::from))?;
    let data = match serde_json::to_string(event) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(event_id = event.id, error = %e, "Failed to encode queued event");
            return None;
        },
    };
    Some(Ok(SseEvent::default()
        .event(kind)
        .data(data)
        .id(event.id.to_string())))
}
