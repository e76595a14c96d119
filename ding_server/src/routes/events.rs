//! Server-sent event stream of repository, build and output events.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::DingError;
use crate::events::HubItem;
use crate::services::webhook_service::constant_time_eq;
use crate::state::DingState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub password: String,
}

/// `event: <kind>` frames with the event as JSON data. Keepalives from the
/// hub become comments.
pub async fn stream(
    State(state): State<DingState>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, DingError> {
    if !constant_time_eq(query.password.as_bytes(), state.config.password.as_bytes()) {
        return Err(DingError::BadAuth);
    }
    tracing::debug!("event stream subscriber connected");

    let events = ReceiverStream::new(state.events.subscribe()).filter_map(|item| async move {
        match item {
            HubItem::Keepalive => Some(Ok(Event::default().comment("keepalive"))),
            HubItem::Event(event) => match Event::default().event(event.kind()).json_data(&*event) {
                Ok(frame) => Some(Ok(frame)),
                Err(e) => {
                    tracing::error!(error = %e, kind = event.kind(), "encoding event");
                    None
                }
            },
        }
    });
    Ok(Sse::new(events))
}
