//! Server-sent event stream advertising mutations to clients.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use tracing::debug;

use crate::server::AppState;

/// `GET /api/v1/events`: a long-lived `text/event-stream` of
/// [`crate::protocol::EventRecord`] JSON payloads.
///
/// Delivery is advisory; slow consumers lose events and reconcile via
/// the periodic full-tree refresh.
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broadcaster.subscribe();
    debug!(subscriber = subscription.id, "event stream opened");

    let stream = subscription.into_receiver().map(|record| {
        let payload = serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(payload))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
