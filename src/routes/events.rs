use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::json;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::middleware::CurrentUser;
use crate::state::AppState;

/// Server-sent stream of lock and unlock events. Lagging subscribers skip missed events.
pub async fn lock_events(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    tracing::debug!(user = %current.id, "Lock event subscriber connected");
    let rx = state.lock_events.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|res| res.ok()).map(|ev| {
        let data = serde_json::to_string(&ev)
            .unwrap_or_else(|_| json!({"type":"warning","message":"serialization error"}).to_string());
        Ok::<Event, std::convert::Infallible>(Event::default().event("lock").data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
}
