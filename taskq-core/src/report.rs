//! Terminal status reports and heartbeat refreshes, with the worker-side
//! retry accounting shared by the reaper.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;

use crate::document::{deep_merge, Document};
use crate::engine::{id_scope, load_task, load_worker, now_ms, snapshot, transition_event, Engine};
use crate::error::{Error, Result};
use crate::filter::filter_from;
use crate::fsm::{check_task_transition, resolve_failure};
use crate::journal::append_event;
use crate::model::{
    EntityType, EventEnvelope, ReportedStatus, TaskRecord, TaskState, WorkerState,
};
use crate::store::{Collection, Patch, RecordStore, ReturnDocument, StoreSession};
use crate::validation::validate_optional_keys;

impl<S: RecordStore> Engine<S> {
    /// Apply a worker's terminal report for a task: compute the new state
    /// from the lifecycle table, update the record, account the failure or
    /// success against the reporting worker, merge the summary, and journal
    /// the transition, all in one transaction.
    pub async fn report_task_status(
        &self,
        queue_id: &str,
        task_id: &str,
        status: ReportedStatus,
        summary_update: Option<Document>,
    ) -> Result<TaskRecord> {
        validate_optional_keys(summary_update.as_ref())?;
        self.with_retries(|| {
            self.try_report(queue_id, task_id, status, summary_update.as_ref())
                .boxed()
        })
        .await
    }

    async fn try_report(
        &self,
        queue_id: &str,
        task_id: &str,
        status: ReportedStatus,
        summary_update: Option<&Document>,
    ) -> Result<TaskRecord> {
        let mut session = self.store.begin(queue_id).await?;
        let task = load_task(&mut session, queue_id, task_id).await?;
        let now = now_ms();

        let (target, new_retries) = match status {
            ReportedStatus::Success => (TaskState::Success, task.retries),
            ReportedStatus::Cancelled => (TaskState::Cancelled, task.retries),
            ReportedStatus::Failed => resolve_failure(task.retries, task.max_retries),
        };
        check_task_transition(task.status, target)?;

        let (updated, envelope) = transition_task(
            &mut session,
            queue_id,
            &task,
            target,
            new_retries,
            summary_update,
            Document::new(),
            now,
        )
        .await?
        .ok_or_else(|| {
            // a concurrent report or sweep got there first
            Error::InvalidStateTransition(format!(
                "task {task_id} left {} before the report applied",
                task.status
            ))
        })?;

        let mut published = vec![envelope];
        if let Some(worker_id) = &task.worker_id {
            let worker_event = match status {
                ReportedStatus::Failed => {
                    record_worker_failure(&mut session, queue_id, worker_id, now).await?
                }
                ReportedStatus::Success => {
                    record_worker_success(&mut session, queue_id, worker_id, now).await?;
                    None
                }
                ReportedStatus::Cancelled => None,
            };
            if let Some(payload) = worker_event {
                published.push(append_event(&mut session, queue_id, now, &payload).await?);
            }
        }

        session.commit().await?;
        self.bus.publish(queue_id, &published);
        metrics::counter!(
            "taskq_tasks_reported_total",
            &[("status", updated.status.as_str())]
        )
        .increment(1);
        Ok(updated)
    }

    /// Refresh a running task's heartbeat. No event is emitted; returns
    /// false when the task is missing or not running.
    pub async fn refresh_task_heartbeat(&self, queue_id: &str, task_id: &str) -> Result<bool> {
        let now = now_ms();
        let matched = self
            .store
            .update_one(
                Collection::Tasks,
                &filter_from([
                    ("_id", json!(task_id)),
                    ("queue_id", json!(queue_id)),
                    ("status", json!(TaskState::Running.as_str())),
                ]),
                &Patch::new().set("last_heartbeat", json!(now.timestamp_millis())),
            )
            .await?;
        Ok(matched > 0)
    }
}

/// Conditionally move a task out of its current state, applying the entry
/// effects for the target. Returns `None` when the conditional update lost:
/// the record already left the expected state, and the caller decides
/// whether that is an error (reports) or a no-op (sweeps).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn transition_task<Sess: StoreSession>(
    session: &mut Sess,
    queue_id: &str,
    task: &TaskRecord,
    target: TaskState,
    new_retries: u32,
    summary_update: Option<&Document>,
    event_metadata: Document,
    now: DateTime<Utc>,
) -> Result<Option<(TaskRecord, EventEnvelope)>> {
    let mut patch = Patch::new()
        .set("status", json!(target.as_str()))
        .set("retries", json!(new_retries))
        .set("last_modified", json!(now.timestamp_millis()));
    match target {
        TaskState::Pending => {
            // requeue: release the holder, keep start_time
            patch = patch.unset("worker_id").unset("last_heartbeat");
        }
        _ => {
            patch = patch.unset("worker_id");
            let mut merged = task.summary.clone();
            if let Some(update) = summary_update {
                deep_merge(&mut merged, update);
            }
            patch = patch.set("summary", json!(merged));
        }
    }

    let won = session
        .find_one_and_update(
            Collection::Tasks,
            &filter_from([
                ("_id", json!(task.task_id)),
                ("queue_id", json!(queue_id)),
                ("status", json!(task.status.as_str())),
            ]),
            &patch,
            ReturnDocument::After,
        )
        .await?;
    let Some(updated) = won else {
        return Ok(None);
    };
    let updated: TaskRecord = crate::document::from_document(updated)?;

    let payload = transition_event(
        queue_id,
        now,
        EntityType::Task,
        &updated.task_id,
        task.status.as_str(),
        target.as_str(),
        snapshot(&updated)?,
        event_metadata,
    );
    let envelope = append_event(session, queue_id, now, &payload).await?;
    Ok(Some((updated, envelope)))
}

/// Count one failure against a worker; past its budget the worker crashes
/// and a worker transition event is produced. Unregistered (ephemeral)
/// holder ids are ignored.
pub(crate) async fn record_worker_failure<Sess: StoreSession>(
    session: &mut Sess,
    queue_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<crate::model::EventPayload>> {
    let Some(worker) = load_worker(session, queue_id, worker_id).await? else {
        return Ok(None);
    };
    let retries = worker.retries + 1;
    let crashes = retries >= worker.max_retries && worker.status != WorkerState::Crashed;

    let mut patch = Patch::new()
        .set("retries", json!(retries))
        .set("last_modified", json!(now.timestamp_millis()));
    if crashes {
        patch = patch.set("status", json!(WorkerState::Crashed.as_str()));
    }
    session
        .update_one(Collection::Workers, &id_scope(queue_id, worker_id), &patch)
        .await?;

    if !crashes {
        return Ok(None);
    }
    let mut crashed = worker.clone();
    crashed.retries = retries;
    crashed.status = WorkerState::Crashed;
    crashed.last_modified = now;
    Ok(Some(transition_event(
        queue_id,
        now,
        EntityType::Worker,
        worker_id,
        worker.status.as_str(),
        WorkerState::Crashed.as_str(),
        snapshot(&crashed)?,
        Document::new(),
    )))
}

/// A successful report resets the worker's consecutive failure count.
pub(crate) async fn record_worker_success<Sess: StoreSession>(
    session: &mut Sess,
    queue_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    session
        .update_one(
            Collection::Workers,
            &id_scope(queue_id, worker_id),
            &Patch::new()
                .set("retries", json!(0))
                .set("last_modified", json!(now.timestamp_millis())),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FetchRequest;
    use crate::engine::EngineConfig;
    use crate::queues::CreateQueue;
    use crate::store::memory::MemoryStore;
    use crate::tasks::SubmitTask;
    use crate::workers::CreateWorker;
    use std::sync::Arc;

    async fn engine_with_queue() -> (Engine<MemoryStore>, String) {
        let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
        let queue = engine
            .create_queue(CreateQueue {
                queue_name: "main".into(),
                password: "pw".into(),
                metadata: None,
            })
            .await
            .unwrap();
        (engine, queue.queue_id)
    }

    fn summary(value: serde_json::Value) -> Option<Document> {
        value.as_object().cloned()
    }

    #[tokio::test]
    async fn success_report_round_trip() {
        let (engine, queue_id) = engine_with_queue().await;
        engine
            .submit_task(&queue_id, SubmitTask::default())
            .await
            .unwrap();
        let running = engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();

        let done = engine
            .report_task_status(
                &queue_id,
                &running.task_id,
                ReportedStatus::Success,
                summary(serde_json::json!({"accuracy": 0.93})),
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskState::Success);
        assert!(done.worker_id.is_none());

        let fetched = engine.get_task(&queue_id, &running.task_id).await.unwrap();
        assert_eq!(fetched.status, TaskState::Success);
        assert_eq!(
            serde_json::Value::Object(fetched.summary),
            serde_json::json!({"accuracy": 0.93})
        );
    }

    #[tokio::test]
    async fn failed_report_requeues_until_budget_is_exhausted() {
        let (engine, queue_id) = engine_with_queue().await;
        engine
            .submit_task(
                &queue_id,
                SubmitTask {
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        let requeued = engine
            .report_task_status(&queue_id, &first.task_id, ReportedStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(requeued.status, TaskState::Pending);
        assert_eq!(requeued.retries, 1);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.last_heartbeat.is_none());
        // start_time survives the requeue
        assert!(requeued.start_time.is_some());

        let second = engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        let failed = engine
            .report_task_status(&queue_id, &second.task_id, ReportedStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(failed.status, TaskState::Failed);
        // clamped at the budget, never beyond it
        assert_eq!(failed.retries, 1);
    }

    #[tokio::test]
    async fn zero_retry_budget_fails_immediately() {
        let (engine, queue_id) = engine_with_queue().await;
        engine
            .submit_task(
                &queue_id,
                SubmitTask {
                    max_retries: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let running = engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        let failed = engine
            .report_task_status(&queue_id, &running.task_id, ReportedStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(failed.status, TaskState::Failed);
        assert_eq!(failed.retries, 0);
    }

    #[tokio::test]
    async fn terminal_states_reject_reports_without_side_effects() {
        let (engine, queue_id) = engine_with_queue().await;
        engine
            .submit_task(&queue_id, SubmitTask::default())
            .await
            .unwrap();
        let running = engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        engine
            .report_task_status(&queue_id, &running.task_id, ReportedStatus::Success, None)
            .await
            .unwrap();
        let events_before = engine.replay_events(&queue_id, 0).await.unwrap().len();

        let rejected = engine
            .report_task_status(&queue_id, &running.task_id, ReportedStatus::Failed, None)
            .await;
        assert!(matches!(rejected, Err(Error::InvalidStateTransition(_))));

        // record unchanged, no new event
        let task = engine.get_task(&queue_id, &running.task_id).await.unwrap();
        assert_eq!(task.status, TaskState::Success);
        let events_after = engine.replay_events(&queue_id, 0).await.unwrap().len();
        assert_eq!(events_before, events_after);
    }

    #[tokio::test]
    async fn summary_deep_merges_on_termination() {
        let (engine, queue_id) = engine_with_queue().await;
        let task = engine
            .submit_task(&queue_id, SubmitTask::default())
            .await
            .unwrap();
        // seed an existing summary through the update surface
        engine
            .update_task(
                &queue_id,
                &task.task_id,
                crate::tasks::TaskUpdate {
                    summary: summary(serde_json::json!({"metrics": {"loss": 1.0}, "note": "x"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();

        let done = engine
            .report_task_status(
                &queue_id,
                &task.task_id,
                ReportedStatus::Success,
                summary(serde_json::json!({"metrics": {"accuracy": 0.9}})),
            )
            .await
            .unwrap();
        assert_eq!(
            serde_json::Value::Object(done.summary),
            serde_json::json!({"metrics": {"loss": 1.0, "accuracy": 0.9}, "note": "x"})
        );
    }

    #[tokio::test]
    async fn failure_reports_crash_the_worker_past_its_budget() {
        let (engine, queue_id) = engine_with_queue().await;
        let worker = engine
            .create_worker(
                &queue_id,
                CreateWorker {
                    max_retries: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for round in 1..=2 {
            engine
                .submit_task(
                    &queue_id,
                    SubmitTask {
                        max_retries: Some(0),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let running = engine
                .fetch_task(&queue_id, FetchRequest::for_worker(&worker.worker_id))
                .await
                .unwrap()
                .unwrap();
            let report = engine
                .report_task_status(&queue_id, &running.task_id, ReportedStatus::Failed, None)
                .await;
            if round < 2 {
                report.unwrap();
            } else {
                // the second failure crashes the worker, then the crashed
                // worker cannot fetch any more
                report.unwrap();
                let refreshed = engine.get_worker(&queue_id, &worker.worker_id).await.unwrap();
                assert_eq!(refreshed.status, WorkerState::Crashed);
                assert_eq!(refreshed.retries, 2);
            }
        }

        let refused = engine
            .fetch_task(&queue_id, FetchRequest::for_worker(&worker.worker_id))
            .await;
        assert!(matches!(refused, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn success_resets_worker_failure_streak() {
        let (engine, queue_id) = engine_with_queue().await;
        let worker = engine
            .create_worker(
                &queue_id,
                CreateWorker {
                    max_retries: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // one failure, then a success, then another failure: never crashes
        for status in [
            ReportedStatus::Failed,
            ReportedStatus::Success,
            ReportedStatus::Failed,
        ] {
            engine
                .submit_task(
                    &queue_id,
                    SubmitTask {
                        max_retries: Some(0),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let running = engine
                .fetch_task(&queue_id, FetchRequest::for_worker(&worker.worker_id))
                .await
                .unwrap()
                .unwrap();
            engine
                .report_task_status(&queue_id, &running.task_id, status, None)
                .await
                .unwrap();
        }
        let refreshed = engine.get_worker(&queue_id, &worker.worker_id).await.unwrap();
        assert_eq!(refreshed.status, WorkerState::Active);
        assert_eq!(refreshed.retries, 1);
    }

    #[tokio::test]
    async fn heartbeat_only_refreshes_running_tasks() {
        let (engine, queue_id) = engine_with_queue().await;
        let task = engine
            .submit_task(&queue_id, SubmitTask::default())
            .await
            .unwrap();
        // pending: no match
        assert!(!engine
            .refresh_task_heartbeat(&queue_id, &task.task_id)
            .await
            .unwrap());

        engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        assert!(engine
            .refresh_task_heartbeat(&queue_id, &task.task_id)
            .await
            .unwrap());
        let first = engine
            .get_task(&queue_id, &task.task_id)
            .await
            .unwrap()
            .last_heartbeat
            .unwrap();

        // idempotent: a second heartbeat moves the clock monotonically
        assert!(engine
            .refresh_task_heartbeat(&queue_id, &task.task_id)
            .await
            .unwrap());
        let task = engine.get_task(&queue_id, &task.task_id).await.unwrap();
        assert_eq!(task.status, TaskState::Running);
        assert!(task.last_heartbeat.unwrap() >= first);

        // heartbeats are not journaled
        assert!(engine
            .replay_events(&queue_id, 0)
            .await
            .unwrap()
            .iter()
            .all(|e| e.sequence <= 1));
    }
}
