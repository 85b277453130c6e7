//! Minimal HTTP surface: a log-streaming endpoint over the Log Broadcaster.
//!
//! Grounded on the teacher's `router` module — an `AppState` carried through
//! `with_state`, routes built with `axum::routing::get`, `TraceLayer` and a
//! permissive `CorsLayer` applied globally. This engine has no panel to
//! authenticate against, so the auth middleware layer is dropped rather than
//! ported; a production deployment fronts this with its own auth. This is
//! demonstration scaffolding, not a product surface: conversations are only
//! ever created by the scheduler loop picking up rows a caller inserted
//! through the repository directly, never through this HTTP layer.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::broadcaster::{LineKind, LogBroadcaster};
use crate::error::ApiError;
use crate::repository::Repository;

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn Repository>,
    pub broadcaster: LogBroadcaster,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/conversations/:id/stream", get(stream_conversation))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Server-sent event stream of one conversation's log/status lines. A
/// subscriber is registered against the broadcaster for the lifetime of the
/// connection and unregistered via the stream's `Drop` guard when the client
/// disconnects. Rejects unknown ids up front rather than silently opening a
/// stream that will never see a single event.
async fn stream_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .repository
        .get_bare_conversation(&conversation_id)
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    let subscriber_id = Uuid::new_v4().to_string();
    let handle = state.broadcaster.register(subscriber_id.clone(), conversation_id);
    let broadcaster = state.broadcaster.clone();

    let events = ReceiverStream::new(handle.receiver).map(move |message| {
        let event_name = match message.kind {
            LineKind::Log => "log",
            LineKind::Status => "status",
            LineKind::Error => "error",
        };
        Ok::<_, Infallible>(Event::default().event(event_name).data(message.text))
    });

    let guarded = UnregisterOnDrop { broadcaster, subscriber_id: handle.subscriber_id.clone(), inner: events };
    Ok(Sse::new(guarded).keep_alive(KeepAlive::default()))
}

/// Wraps the SSE event stream so the broadcaster drops the subscriber slot
/// as soon as the underlying connection is torn down, instead of waiting
/// for the janitor's idle sweep.
struct UnregisterOnDrop<S> {
    broadcaster: LogBroadcaster,
    subscriber_id: String,
    inner: S,
}

impl<S: Stream + Unpin> Stream for UnregisterOnDrop<S> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for UnregisterOnDrop<S> {
    fn drop(&mut self) {
        self.broadcaster.unregister(&self.subscriber_id);
    }
}
