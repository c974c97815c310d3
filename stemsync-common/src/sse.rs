//! Server-Sent Events (SSE) utilities
//!
//! Renders job progress streams as axum SSE responses.

use crate::events::{ProgressEvent, StreamItem};
use axum::response::sse::{Event, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use tracing::debug;

/// Comment text sent on idle ticks (`: keepalive`)
pub const KEEPALIVE_COMMENT: &str = "keepalive";

/// Convert a progress event into an SSE frame
pub fn to_sse_event(event: &ProgressEvent) -> Event {
    Event::default()
        .event(event.event_type())
        .data(event.data_json().to_string())
}

/// Idle keepalive frame
pub fn keepalive_event() -> Event {
    Event::default().comment(KEEPALIVE_COMMENT)
}

/// Wrap a job's item stream in an SSE response
///
/// The stream itself produces keepalives, so no axum `KeepAlive` is attached;
/// the response ends when the item stream ends.
///
/// # Example
/// ```rust,ignore
/// let receiver = orchestrator.submit(request).await?;
/// Ok(stemsync_common::sse::progress_sse(receiver.into_stream()))
/// ```
pub fn progress_sse<S>(items: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = StreamItem> + Send + 'static,
{
    let stream = items.map(|item| {
        let event = match item {
            StreamItem::Event(event) => {
                debug!(event_type = event.event_type(), "SSE: Sending event");
                to_sse_event(&event)
            }
            StreamItem::Keepalive => keepalive_event(),
        };
        Ok::<_, Infallible>(event)
    });

    Sse::new(stream)
}
