//! The fetch path: atomically claim the highest-priority eligible pending
//! task for a worker and transition it to running.

use futures::FutureExt;
use serde_json::json;

use crate::document::{from_document, Document};
use crate::engine::{load_worker, now_ms, snapshot, transition_event, Engine};
use crate::error::{Error, Result};
use crate::filter::{and, filter_from, Filter};
use crate::journal::append_event;
use crate::model::{new_id, EntityType, TaskRecord, TaskState, WorkerState};
use crate::store::{
    Collection, FindOptions, Patch, RecordStore, ReturnDocument, SortOrder, StoreSession,
};
use crate::validation::{parse_duration, validate_document_keys};

/// Candidates examined per fetch before giving up; losing a claim race this
/// many times in one call means the queue is being drained anyway.
const CLAIM_CANDIDATES: usize = 32;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub worker_id: Option<String>,
    /// Duration string, reserved for future lease caps; validated only.
    pub eta_max: Option<String>,
    pub start_heartbeat: bool,
    /// Dotted paths that must be present in `args`.
    pub required_fields: Option<Vec<String>>,
    pub extra_filter: Option<Filter>,
}

impl Default for FetchRequest {
    fn default() -> Self {
        FetchRequest {
            worker_id: None,
            eta_max: None,
            // heartbeat tracking is on unless a caller opts out
            start_heartbeat: true,
            required_fields: None,
            extra_filter: None,
        }
    }
}

impl FetchRequest {
    pub fn for_worker(worker_id: &str) -> Self {
        FetchRequest {
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        }
    }
}

impl<S: RecordStore> Engine<S> {
    /// Claim the next eligible task. Returns `None` when nothing matches;
    /// concurrent fetchers are serialized by the conditional update, so
    /// exactly one caller wins any given task.
    pub async fn fetch_task(
        &self,
        queue_id: &str,
        request: FetchRequest,
    ) -> Result<Option<TaskRecord>> {
        if let Some(eta_max) = &request.eta_max {
            parse_duration(eta_max)?;
        }
        if let Some(required) = &request.required_fields {
            for path in required {
                let as_keys: Document = path
                    .split('.')
                    .map(|segment| (segment.to_string(), json!(null)))
                    .collect();
                validate_document_keys(&as_keys)
                    .map_err(|_| Error::Validation(format!("illegal required field {path:?}")))?;
            }
        }
        if let Some(extra) = &request.extra_filter {
            // surface filter errors as validation before touching the store
            crate::filter::matches(extra, &Document::new())?;
        }

        self.with_retries(|| self.try_fetch(queue_id, &request).boxed())
            .await
    }

    async fn try_fetch(
        &self,
        queue_id: &str,
        request: &FetchRequest,
    ) -> Result<Option<TaskRecord>> {
        let mut session = self.store.begin(queue_id).await?;

        if let Some(worker_id) = &request.worker_id {
            let worker = load_worker(&mut session, queue_id, worker_id)
                .await?
                .ok_or(Error::NotFound("worker"))?;
            if worker.status != WorkerState::Active {
                return Err(Error::Conflict(format!(
                    "worker {} is not available: status is {}",
                    worker_id, worker.status
                )));
            }
        }

        let mut eligible = filter_from([
            ("queue_id", json!(queue_id)),
            ("status", json!(TaskState::Pending.as_str())),
        ]);
        for path in request.required_fields.iter().flatten() {
            eligible.insert(format!("args.{path}"), json!({"$exists": true}));
        }
        let eligible = and(eligible, request.extra_filter.clone().unwrap_or_default());

        let options = FindOptions {
            limit: Some(CLAIM_CANDIDATES),
            offset: 0,
            sort: vec![
                ("priority".into(), SortOrder::Desc),
                ("created_at".into(), SortOrder::Asc),
            ],
        };
        let candidates = session
            .find_many(Collection::Tasks, &eligible, &options)
            .await?;

        let now = now_ms();
        // Tasks fetched without a registered worker still get a holder id,
        // so `worker_id set <=> running` holds for every record.
        let holder = request
            .worker_id
            .clone()
            .unwrap_or_else(new_id);

        for candidate in candidates {
            let candidate: TaskRecord = from_document(candidate)?;
            let mut claim = Patch::new()
                .set("status", json!(TaskState::Running.as_str()))
                .set("worker_id", json!(&holder))
                .set(
                    "start_time",
                    json!(candidate
                        .start_time
                        .unwrap_or(now)
                        .timestamp_millis()),
                )
                .set("last_modified", json!(now.timestamp_millis()));
            if request.start_heartbeat {
                claim = claim.set("last_heartbeat", json!(now.timestamp_millis()));
            }

            let won = session
                .find_one_and_update(
                    Collection::Tasks,
                    &filter_from([
                        ("_id", json!(candidate.task_id)),
                        ("queue_id", json!(queue_id)),
                        ("status", json!(TaskState::Pending.as_str())),
                    ]),
                    &claim,
                    ReturnDocument::After,
                )
                .await?;
            let Some(claimed) = won else {
                // lost the race for this candidate, try the next one
                continue;
            };
            let claimed: TaskRecord = from_document(claimed)?;

            let payload = transition_event(
                queue_id,
                now,
                EntityType::Task,
                &claimed.task_id,
                TaskState::Pending.as_str(),
                TaskState::Running.as_str(),
                snapshot(&claimed)?,
                Document::new(),
            );
            let envelope = append_event(&mut session, queue_id, now, &payload).await?;
            session.commit().await?;
            self.bus.publish(queue_id, &[envelope]);
            metrics::counter!("taskq_tasks_fetched_total").increment(1);
            return Ok(Some(claimed));
        }
        // nothing eligible: no transition, no event
        Ok(None)
    }
}
