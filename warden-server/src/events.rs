//! SSE fan-out of engine state changes to connected UI clients.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::AppState;

pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = state.supervisor.updates();

    let stream = BroadcastStream::new(updates).filter_map(|update| match update {
        Ok(update) => Event::default()
            .event("status")
            .json_data(&update)
            .ok()
            .map(Ok::<_, Infallible>),
        // A lagged subscriber just misses updates; the next poll of the
        // status endpoints resynchronizes it.
        Err(_) => None,
    });

    // Keepalive prevents idle proxies from reaping the connection.
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}
