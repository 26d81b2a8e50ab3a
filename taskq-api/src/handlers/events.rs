//! The long-lived event stream: an SSE connection that opens with a
//! `{status, client_id}` envelope, optionally replays committed events past
//! a cursor, then follows the live feed in order.

use std::convert::Infallible;

use axum::extract::{Extension, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc::Receiver;

use taskq_core::model::EventEnvelope;
use taskq_core::store::RecordStore;

use crate::auth::AuthedQueue;
use crate::error::ApiError;
use crate::models::{EventEnvelopeOut, EventSubscriptionResponse, EventsQuery};
use crate::router::AppState;

fn envelope_event(envelope: EventEnvelope) -> Event {
    Event::default()
        .json_data(EventEnvelopeOut::from(envelope))
        .unwrap_or_default()
}

/// Live stream that discards anything at or below the replay cursor, so a
/// transition committed between replay and subscription cannot be doubled.
fn live_after(
    receiver: Receiver<EventEnvelope>,
    after: u64,
) -> impl Stream<Item = EventEnvelope> {
    stream::unfold((receiver, after), |(mut receiver, last)| async move {
        loop {
            match receiver.recv().await {
                Some(envelope) if envelope.sequence <= last => continue,
                Some(envelope) => {
                    let sequence = envelope.sequence;
                    return Some((envelope, (receiver, sequence)));
                }
                None => return None,
            }
        }
    })
}

pub async fn subscribe<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Register the subscriber before reading the backlog: anything committed
    // in between is buffered and deduplicated by sequence.
    let subscription = state.engine.subscribe_events(queue.queue_id());

    let backlog = match query.since {
        Some(since) => state
            .engine
            .replay_events(queue.queue_id(), since)
            .await
            .map_err(|e| state.err(e))?,
        None => Vec::new(),
    };
    let cursor = backlog
        .last()
        .map(|envelope| envelope.sequence)
        .unwrap_or_else(|| query.since.unwrap_or(0));

    let hello = Event::default()
        .json_data(EventSubscriptionResponse {
            status: "connected",
            client_id: subscription.client_id.clone(),
        })
        .unwrap_or_default();

    let events = stream::once(async move { hello })
        .chain(stream::iter(backlog).map(envelope_event))
        .chain(live_after(subscription.receiver, cursor).map(envelope_event))
        .map(Ok);

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
