//! The lifecycle engine: a store handle, the event bus, and tunable
//! defaults, threaded through every operation. Constructed once at startup
//! and injected into handlers; tests construct it over the memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::time::sleep;

use crate::document::{from_document, to_document, Document};
use crate::error::{Error, Result};
use crate::filter::{filter_from, Filter};
use crate::journal::EventBus;
use crate::model::{
    EntityType, EventPayload, StateTransitionEvent, TaskRecord, WorkerRecord,
};
use crate::store::{Collection, RecordStore, StoreSession};

/// Retry budget for transient store failures, with doubling backoff.
const STORE_RETRY_BUDGET: usize = 3;
const STORE_RETRY_INITIAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The queue-level heartbeat interval; tasks submitted without an
    /// explicit heartbeat timeout default to three times this.
    pub heartbeat_interval_secs: f64,
    /// Upper bound on tasks transitioned per reaper sweep and queue, so a
    /// backlog cannot starve the tick cadence.
    pub reaper_batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60.0,
            reaper_batch_limit: 100,
        }
    }
}

pub struct Engine<S: RecordStore> {
    pub(crate) store: Arc<S>,
    pub(crate) bus: EventBus,
    pub(crate) config: EngineConfig,
}

impl<S: RecordStore> Engine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            bus: EventBus::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn default_heartbeat_timeout(&self) -> f64 {
        self.config.heartbeat_interval_secs * 3.0
    }

    /// Re-run an operation on transient store failures, with exponential
    /// backoff, before surfacing the error. Transitions are transactional,
    /// so re-running an aborted one is safe.
    pub(crate) async fn with_retries<'a, T>(
        &self,
        mut op: impl FnMut() -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let mut backoff = STORE_RETRY_INITIAL;
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt + 1 < STORE_RETRY_BUDGET => {
                    attempt += 1;
                    tracing::warn!("retrying after transient store failure: {err}");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }
}

/// The current instant, truncated to the store's millisecond resolution so
/// in-memory values compare equal to their stored form.
pub fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Filter scoping a record id to its queue.
pub(crate) fn id_scope(queue_id: &str, id: &str) -> Filter {
    filter_from([("_id", json!(id)), ("queue_id", json!(queue_id))])
}

pub(crate) async fn load_task<Sess: StoreSession>(
    session: &mut Sess,
    queue_id: &str,
    task_id: &str,
) -> Result<TaskRecord> {
    session
        .find_one(Collection::Tasks, &id_scope(queue_id, task_id))
        .await?
        .map(from_document)
        .transpose()?
        .ok_or(Error::NotFound("task"))
}

pub(crate) async fn load_worker<Sess: StoreSession>(
    session: &mut Sess,
    queue_id: &str,
    worker_id: &str,
) -> Result<Option<WorkerRecord>> {
    session
        .find_one(Collection::Workers, &id_scope(queue_id, worker_id))
        .await?
        .map(from_document)
        .transpose()
}

/// Build the journal payload for a committed transition, with a snapshot of
/// the entity after the change.
pub(crate) fn transition_event(
    queue_id: &str,
    timestamp: DateTime<Utc>,
    entity_type: EntityType,
    entity_id: &str,
    old_state: &str,
    new_state: &str,
    entity_data: Document,
    metadata: Document,
) -> EventPayload {
    EventPayload::StateTransition(StateTransitionEvent {
        queue_id: queue_id.to_string(),
        timestamp,
        entity_type,
        entity_id: entity_id.to_string(),
        old_state: old_state.to_string(),
        new_state: new_state.to_string(),
        entity_data,
        metadata,
    })
}

pub(crate) fn snapshot<T: serde::Serialize>(record: &T) -> Result<Document> {
    to_document(record)
}
