//! Server-Sent Events (SSE) stream for real-time status delivery.
//!
//! Each client first receives the current connection status, then every
//! event the [`StatusHub`](crate::status_events::StatusHub) publishes. The
//! subscription is dropped from the hub as soon as the client goes away.

use super::AppState;
use crate::status_events::{StatusEvent, StatusHub};
use axum::{
    extract::State,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// GET /api/events
pub async fn handle_sse_events(State(state): State<AppState>) -> impl IntoResponse {
    let current = StatusHub::frame(&StatusEvent::Status(state.status_payload()));
    let (id, rx) = state.hub.subscribe();
    tracing::debug!(subscriber = id, "SSE client connected");
    let subscription = Subscription {
        hub: state.hub.clone(),
        id,
    };

    let stream = tokio_stream::once(current)
        .chain(UnboundedReceiverStream::new(rx))
        .map(move |frame| {
            let _subscription = &subscription;
            Ok::<_, Infallible>(Event::default().data(frame))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Removes the subscriber from the hub when the response stream is dropped.
struct Subscription {
    hub: Arc<StatusHub>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
        tracing::debug!(subscriber = self.id, "SSE client disconnected");
    }
}
