//! The per-queue event journal: gap-free sequence allocation inside the
//! transition's transaction, and a short-lived in-memory fan-out for live
//! subscribers. Persistence is the `events` collection; subscribers that fall
//! behind are dropped and recover through `replay`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::document::{from_document, to_document};
use crate::error::{Error, Result};
use crate::filter::filter_from;
use crate::model::{new_id, EventEnvelope, EventPayload, EventRecord};
use crate::store::{Collection, FindOptions, RecordStore, SortOrder, StoreSession};

/// Delivery buffer per subscriber; a subscriber this far behind is dropped.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Attempts at allocating a sequence number before the transition aborts.
const SEQUENCE_RETRIES: usize = 3;

/// Read the current max sequence for the queue and append the next event
/// record inside the caller's transaction. The unique `(queue_id, sequence)`
/// index backstops concurrent allocators; on a conflict the read-and-insert
/// is retried a bounded number of times.
pub async fn append_event<S: StoreSession>(
    session: &mut S,
    queue_id: &str,
    timestamp: DateTime<Utc>,
    payload: &EventPayload,
) -> Result<EventEnvelope> {
    let mut last_err = None;
    for _ in 0..SEQUENCE_RETRIES {
        let next = max_sequence(session, queue_id).await? + 1;
        let record = EventRecord {
            event_id: new_id(),
            queue_id: queue_id.to_string(),
            sequence: next,
            timestamp,
            event: payload.clone(),
        };
        match session.insert(Collection::Events, to_document(&record)?).await {
            Ok(()) => return Ok(record.into()),
            Err(err @ Error::StoreTransient(_)) => last_err = Some(err),
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::StoreTransient("sequence allocation failed".into())))
}

async fn max_sequence<S: StoreSession>(session: &mut S, queue_id: &str) -> Result<u64> {
    let filter = filter_from([("queue_id", json!(queue_id))]);
    let options = FindOptions {
        limit: Some(1),
        offset: 0,
        sort: vec![("sequence".into(), SortOrder::Desc)],
    };
    let latest = session
        .find_many(Collection::Events, &filter, &options)
        .await?;
    match latest.into_iter().next() {
        Some(doc) => {
            let record: EventRecord = from_document(doc)?;
            Ok(record.sequence)
        }
        None => Ok(0),
    }
}

/// An active subscription: the id echoed to the client and the delivery end.
pub struct Subscription {
    pub client_id: String,
    pub receiver: mpsc::Receiver<EventEnvelope>,
}

struct SubscriberHandle {
    client_id: String,
    sender: mpsc::Sender<EventEnvelope>,
}

/// In-memory broadcast registry, `queue_id -> subscribers`, guarded by a
/// plain lock (publishing never awaits while holding it).
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<HashMap<String, Vec<SubscriberHandle>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn subscribe(&self, queue_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let client_id = new_id();
        let mut map = self.inner.lock().expect("poisoned EventBus lock");
        map.entry(queue_id.to_string())
            .or_default()
            .push(SubscriberHandle {
                client_id: client_id.clone(),
                sender,
            });
        Subscription {
            client_id,
            receiver,
        }
    }

    pub fn unsubscribe(&self, queue_id: &str, client_id: &str) {
        let mut map = self.inner.lock().expect("poisoned EventBus lock");
        if let Some(subscribers) = map.get_mut(queue_id) {
            subscribers.retain(|s| s.client_id != client_id);
            if subscribers.is_empty() {
                map.remove(queue_id);
            }
        }
    }

    /// Fan committed envelopes out to live subscribers. A subscriber whose
    /// buffer is full has lost the no-skip guarantee and is dropped; its
    /// stream ends and it must re-subscribe with a replay cursor.
    pub fn publish(&self, queue_id: &str, envelopes: &[EventEnvelope]) {
        if envelopes.is_empty() {
            return;
        }
        let mut map = self.inner.lock().expect("poisoned EventBus lock");
        let Some(subscribers) = map.get_mut(queue_id) else {
            return;
        };
        subscribers.retain(|subscriber| {
            for envelope in envelopes {
                if let Err(err) = subscriber.sender.try_send(envelope.clone()) {
                    warn!(
                        client_id = %subscriber.client_id,
                        "dropping event subscriber: {err}"
                    );
                    return false;
                }
            }
            true
        });
        if subscribers.is_empty() {
            map.remove(queue_id);
        }
    }
}

impl<S: RecordStore> crate::engine::Engine<S> {
    /// Open a live subscription for one queue. The caller owns the delivery
    /// buffer; it should unsubscribe with the returned client id when done.
    pub fn subscribe_events(&self, queue_id: &str) -> Subscription {
        self.bus.subscribe(queue_id)
    }

    pub fn unsubscribe_events(&self, queue_id: &str, client_id: &str) {
        self.bus.unsubscribe(queue_id, client_id);
    }

    /// All committed events with `sequence > since_sequence`, in order.
    /// Recovery path for subscribers that were dropped or reconnected.
    pub async fn replay_events(
        &self,
        queue_id: &str,
        since_sequence: u64,
    ) -> Result<Vec<EventEnvelope>> {
        let filter = {
            let mut f = filter_from([("queue_id", json!(queue_id))]);
            f.insert("sequence".into(), json!({"$gt": since_sequence}));
            f
        };
        let options = FindOptions::sorted(vec![("sequence".into(), SortOrder::Asc)]);
        let docs = self
            .store()
            .find_many(Collection::Events, &filter, &options)
            .await?;
        docs.into_iter()
            .map(|doc| from_document::<EventRecord>(doc).map(EventEnvelope::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, StateTransitionEvent};
    use crate::store::memory::MemoryStore;
    use crate::store::RecordStore;

    fn payload(queue_id: &str) -> EventPayload {
        EventPayload::StateTransition(StateTransitionEvent {
            queue_id: queue_id.into(),
            timestamp: Utc::now(),
            entity_type: EntityType::Task,
            entity_id: "t1".into(),
            old_state: "pending".into(),
            new_state: "running".into(),
            entity_data: Default::default(),
            metadata: Default::default(),
        })
    }

    #[tokio::test]
    async fn sequences_are_contiguous_from_one() {
        let store = MemoryStore::new();
        let mut session = store.begin("q1").await.unwrap();
        for expected in 1..=5u64 {
            let envelope = append_event(&mut session, "q1", Utc::now(), &payload("q1"))
                .await
                .unwrap();
            assert_eq!(envelope.sequence, expected);
        }
        session.commit().await.unwrap();

        // Sequences are per queue
        let mut session = store.begin("q2").await.unwrap();
        let envelope = append_event(&mut session, "q2", Utc::now(), &payload("q2"))
            .await
            .unwrap();
        assert_eq!(envelope.sequence, 1);
    }

    #[tokio::test]
    async fn bus_delivers_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("q1");

        let envelopes: Vec<EventEnvelope> = (1..=3)
            .map(|sequence| EventEnvelope {
                sequence,
                timestamp: Utc::now(),
                event: payload("q1"),
            })
            .collect();
        bus.publish("q1", &envelopes);

        for expected in 1..=3u64 {
            let got = sub.receiver.recv().await.unwrap();
            assert_eq!(got.sequence, expected);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("q1");

        let flood: Vec<EventEnvelope> = (1..=(SUBSCRIBER_BUFFER as u64 + 1))
            .map(|sequence| EventEnvelope {
                sequence,
                timestamp: Utc::now(),
                event: payload("q1"),
            })
            .collect();
        bus.publish("q1", &flood);

        // The buffer drains in order, then the stream ends: no skips within
        // the connected session.
        let mut last = 0;
        while let Some(envelope) = sub.receiver.recv().await {
            assert_eq!(envelope.sequence, last + 1);
            last = envelope.sequence;
        }
        assert_eq!(last, SUBSCRIBER_BUFFER as u64);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handle() {
        let bus = EventBus::new();
        let sub = bus.subscribe("q1");
        bus.unsubscribe("q1", &sub.client_id);
        bus.publish(
            "q1",
            &[EventEnvelope {
                sequence: 1,
                timestamp: Utc::now(),
                event: payload("q1"),
            }],
        );
        let mut receiver = sub.receiver;
        assert!(receiver.recv().await.is_none());
    }
}
