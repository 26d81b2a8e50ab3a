//! Worker lifecycle: registration, listing, operator status reports, and
//! deletion with its task unbinding cascade.

use futures::FutureExt;
use serde_json::json;

use crate::document::{from_document, to_document, Document};
use crate::engine::{id_scope, load_worker, now_ms, snapshot, transition_event, Engine};
use crate::error::{Error, Result};
use crate::filter::{and, filter_from, Filter};
use crate::fsm::check_worker_transition;
use crate::journal::append_event;
use crate::model::{
    new_id, EntityType, TaskRecord, TaskState, WorkerRecord, WorkerReportedStatus, WorkerState,
};
use crate::report::transition_task;
use crate::store::{Collection, FindOptions, Patch, RecordStore, SortOrder, StoreSession};
use crate::tasks::{LIST_LIMIT_DEFAULT, LIST_LIMIT_MAX};
use crate::validation::{validate_name, validate_optional_keys};

pub const DEFAULT_WORKER_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct CreateWorker {
    pub worker_name: Option<String>,
    pub metadata: Option<Document>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ListWorkers {
    pub offset: usize,
    pub limit: Option<usize>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    pub extra_filter: Option<Filter>,
}

impl<S: RecordStore> Engine<S> {
    pub async fn create_worker(
        &self,
        queue_id: &str,
        request: CreateWorker,
    ) -> Result<WorkerRecord> {
        if let Some(name) = &request.worker_name {
            validate_name("worker", name)?;
        }
        validate_optional_keys(request.metadata.as_ref())?;

        let now = now_ms();
        let record = WorkerRecord {
            worker_id: new_id(),
            queue_id: queue_id.to_string(),
            worker_name: request.worker_name,
            status: WorkerState::Active,
            metadata: request.metadata.unwrap_or_default(),
            retries: 0,
            max_retries: request.max_retries.unwrap_or(DEFAULT_WORKER_MAX_RETRIES),
            created_at: now,
            last_modified: now,
        };
        self.store
            .insert(Collection::Workers, to_document(&record)?)
            .await?;
        Ok(record)
    }

    pub async fn get_worker(&self, queue_id: &str, worker_id: &str) -> Result<WorkerRecord> {
        self.store
            .find_one(Collection::Workers, &id_scope(queue_id, worker_id))
            .await?
            .map(from_document)
            .transpose()?
            .ok_or(Error::NotFound("worker"))
    }

    pub async fn list_workers(
        &self,
        queue_id: &str,
        request: ListWorkers,
    ) -> Result<Vec<WorkerRecord>> {
        let limit = request.limit.unwrap_or(LIST_LIMIT_DEFAULT);
        if limit > LIST_LIMIT_MAX {
            return Err(Error::Validation(format!(
                "limit must be at most {LIST_LIMIT_MAX}"
            )));
        }

        let mut scoped = filter_from([("queue_id", json!(queue_id))]);
        if let Some(worker_id) = request.worker_id {
            scoped.insert("_id".into(), json!(worker_id));
        }
        if let Some(worker_name) = request.worker_name {
            scoped.insert("worker_name".into(), json!(worker_name));
        }
        let filter = and(scoped, request.extra_filter.unwrap_or_default());

        let options = FindOptions {
            limit: Some(limit),
            offset: request.offset,
            sort: vec![("created_at".into(), SortOrder::Asc)],
        };
        self.store
            .find_many(Collection::Workers, &filter, &options)
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Operator report moving a worker between active, suspended and failed.
    /// Reactivating a crashed or failed worker happens through exactly this
    /// call; the streak resets with it.
    pub async fn report_worker_status(
        &self,
        queue_id: &str,
        worker_id: &str,
        status: WorkerReportedStatus,
    ) -> Result<WorkerRecord> {
        self.with_retries(|| self.try_report_worker(queue_id, worker_id, status).boxed())
            .await
    }

    async fn try_report_worker(
        &self,
        queue_id: &str,
        worker_id: &str,
        status: WorkerReportedStatus,
    ) -> Result<WorkerRecord> {
        let mut session = self.store.begin(queue_id).await?;
        let worker = load_worker(&mut session, queue_id, worker_id)
            .await?
            .ok_or(Error::NotFound("worker"))?;
        let target = WorkerState::from(status);
        if worker.status == target {
            return Ok(worker);
        }
        check_worker_transition(worker.status, target)?;

        let now = now_ms();
        let mut updated = worker.clone();
        updated.status = target;
        updated.last_modified = now;
        let mut patch = Patch::new()
            .set("status", json!(target.as_str()))
            .set("last_modified", json!(now.timestamp_millis()));
        if target == WorkerState::Active {
            updated.retries = 0;
            patch = patch.set("retries", json!(0));
        }
        session
            .update_one(Collection::Workers, &id_scope(queue_id, worker_id), &patch)
            .await?;

        let payload = transition_event(
            queue_id,
            now,
            EntityType::Worker,
            worker_id,
            worker.status.as_str(),
            target.as_str(),
            snapshot(&updated)?,
            Document::new(),
        );
        let envelope = append_event(&mut session, queue_id, now, &payload).await?;
        session.commit().await?;
        self.bus.publish(queue_id, &[envelope]);
        Ok(updated)
    }

    /// Delete a worker. With `cascade_update`, tasks it still holds are
    /// released back to pending first (no retry is charged: deletion is an
    /// operator action, not a task failure).
    pub async fn delete_worker(
        &self,
        queue_id: &str,
        worker_id: &str,
        cascade_update: bool,
    ) -> Result<()> {
        self.with_retries(|| {
            self.try_delete_worker(queue_id, worker_id, cascade_update)
                .boxed()
        })
        .await
    }

    async fn try_delete_worker(
        &self,
        queue_id: &str,
        worker_id: &str,
        cascade_update: bool,
    ) -> Result<()> {
        let mut session = self.store.begin(queue_id).await?;
        let now = now_ms();
        let mut published = Vec::new();

        if cascade_update {
            let held = session
                .find_many(
                    Collection::Tasks,
                    &filter_from([
                        ("queue_id", json!(queue_id)),
                        ("worker_id", json!(worker_id)),
                        ("status", json!(TaskState::Running.as_str())),
                    ]),
                    &FindOptions::default(),
                )
                .await?;
            for doc in held {
                let task: TaskRecord = from_document(doc)?;
                if let Some((_, envelope)) = transition_task(
                    &mut session,
                    queue_id,
                    &task,
                    TaskState::Pending,
                    task.retries,
                    None,
                    Document::new(),
                    now,
                )
                .await?
                {
                    published.push(envelope);
                }
            }
        }

        let deleted = session
            .delete_many(Collection::Workers, &id_scope(queue_id, worker_id))
            .await?;
        if deleted == 0 {
            return Err(Error::NotFound("worker"));
        }
        session.commit().await?;
        self.bus.publish(queue_id, &published);
        Ok(())
    }
}
