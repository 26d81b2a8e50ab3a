//! The heartbeat and timeout reaper: each sweep finds running tasks whose
//! heartbeat went silent or whose wall-clock cap elapsed, and drives the
//! timeout transitions. Driven by the server's periodic tick loop.

use chrono::Duration;
use futures::FutureExt;
use serde_json::json;
use tracing::{info, warn};

use crate::document::{from_document, Document};
use crate::engine::{now_ms, Engine};
use crate::error::Result;
use crate::filter::filter_from;
use crate::fsm::resolve_failure;
use crate::journal::append_event;
use crate::model::{QueueRecord, TaskRecord, TaskState};
use crate::report::{record_worker_failure, transition_task};
use crate::store::{Collection, FindOptions, RecordStore, SortOrder, StoreSession};

const REASON_HEARTBEAT: &str = "timeout_heartbeat";
const REASON_TASK: &str = "timeout_task";

fn secs_f64(seconds: f64) -> Duration {
    Duration::milliseconds((seconds * 1000.0) as i64)
}

impl<S: RecordStore> Engine<S> {
    /// One sweep over one queue. Returns the ids of the tasks transitioned.
    /// Idempotent: the per-task conditional update turns a task already
    /// moved by a report into a no-op.
    pub async fn handle_timeouts(&self, queue_id: &str) -> Result<Vec<String>> {
        self.with_retries(|| self.try_handle_timeouts(queue_id).boxed())
            .await
    }

    async fn try_handle_timeouts(&self, queue_id: &str) -> Result<Vec<String>> {
        let mut session = self.store.begin(queue_id).await?;
        let now = now_ms();

        let running = filter_from([
            ("queue_id", json!(queue_id)),
            ("status", json!(TaskState::Running.as_str())),
        ]);
        // Oldest heartbeats first; the batch limit bounds per-sweep work so
        // a backlog cannot starve the tick cadence.
        let options = FindOptions {
            limit: Some(self.config.reaper_batch_limit),
            offset: 0,
            sort: vec![("last_heartbeat".into(), SortOrder::Asc)],
        };
        let candidates = session
            .find_many(Collection::Tasks, &running, &options)
            .await?;

        let mut transitioned = Vec::new();
        let mut published = Vec::new();
        for doc in candidates {
            let task: TaskRecord = from_document(doc)?;

            let task_overdue = match (task.start_time, task.task_timeout) {
                (Some(start), Some(cap)) => start + Duration::seconds(cap) < now,
                _ => false,
            };
            let heartbeat_overdue = task
                .last_heartbeat
                .is_some_and(|beat| beat + secs_f64(task.heartbeat_timeout) < now);

            let (target, new_retries, reason) = if task_overdue {
                // the wall-clock cap is hard: no requeue
                (
                    TaskState::Failed,
                    task.retries.min(task.max_retries),
                    REASON_TASK,
                )
            } else if heartbeat_overdue {
                let (state, retries) = resolve_failure(task.retries, task.max_retries);
                (state, retries, REASON_HEARTBEAT)
            } else {
                continue;
            };

            let mut event_metadata = Document::new();
            event_metadata.insert("reason".into(), json!(reason));
            let Some((_, envelope)) = transition_task(
                &mut session,
                queue_id,
                &task,
                target,
                new_retries,
                None,
                event_metadata,
                now,
            )
            .await?
            else {
                // already transitioned by a report racing this sweep
                continue;
            };
            published.push(envelope);
            transitioned.push(task.task_id.clone());
            metrics::counter!("taskq_tasks_timed_out_total", &[("reason", reason)]).increment(1);

            // the silent holder takes one failure on its record
            if let Some(worker_id) = &task.worker_id {
                if let Some(payload) =
                    record_worker_failure(&mut session, queue_id, worker_id, now).await?
                {
                    published.push(append_event(&mut session, queue_id, now, &payload).await?);
                }
            }
        }

        session.commit().await?;
        self.bus.publish(queue_id, &published);
        Ok(transitioned)
    }

    /// Sweep every queue once. Per-queue failures are logged and skipped so
    /// one bad queue cannot halt the tick loop.
    pub async fn sweep_timeouts(&self) -> usize {
        let queues = match self
            .store
            .find_many(
                Collection::Queues,
                &Document::new(),
                &FindOptions::default(),
            )
            .await
        {
            Ok(queues) => queues,
            Err(err) => {
                warn!("timeout sweep could not list queues: {err}");
                return 0;
            }
        };

        let mut total = 0;
        for doc in queues {
            let queue: QueueRecord = match from_document(doc) {
                Ok(queue) => queue,
                Err(err) => {
                    warn!("timeout sweep skipped a malformed queue record: {err}");
                    continue;
                }
            };
            match self.handle_timeouts(&queue.queue_id).await {
                Ok(transitioned) if !transitioned.is_empty() => {
                    info!(
                        queue = %queue.queue_name,
                        "transitioned {} timed out tasks",
                        transitioned.len()
                    );
                    total += transitioned.len();
                }
                Ok(_) => {}
                Err(err) => warn!(queue = %queue.queue_name, "timeout sweep failed: {err}"),
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FetchRequest;
    use crate::engine::EngineConfig;
    use crate::model::WorkerState;
    use crate::queues::CreateQueue;
    use crate::store::memory::MemoryStore;
    use crate::tasks::SubmitTask;
    use crate::workers::CreateWorker;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

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

    fn short_heartbeat(max_retries: u32) -> SubmitTask {
        SubmitTask {
            heartbeat_timeout: Some(0.05),
            max_retries: Some(max_retries),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn silent_task_is_requeued_then_failed() {
        let (engine, queue_id) = engine_with_queue().await;
        let task = engine
            .submit_task(&queue_id, short_heartbeat(1))
            .await
            .unwrap();

        // first silent run: requeued with one retry burned
        engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        let swept = engine.handle_timeouts(&queue_id).await.unwrap();
        assert_eq!(swept, vec![task.task_id.clone()]);
        let requeued = engine.get_task(&queue_id, &task.task_id).await.unwrap();
        assert_eq!(requeued.status, TaskState::Pending);
        assert_eq!(requeued.retries, 1);
        assert!(requeued.worker_id.is_none());

        // second silent run: budget exhausted, failed with retries clamped
        engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        engine.handle_timeouts(&queue_id).await.unwrap();
        let failed = engine.get_task(&queue_id, &task.task_id).await.unwrap();
        assert_eq!(failed.status, TaskState::Failed);
        assert_eq!(failed.retries, 1);
    }

    #[tokio::test]
    async fn healthy_heartbeat_survives_the_sweep() {
        let (engine, queue_id) = engine_with_queue().await;
        let task = engine
            .submit_task(
                &queue_id,
                SubmitTask {
                    heartbeat_timeout: Some(10.0),
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

        let swept = engine.handle_timeouts(&queue_id).await.unwrap();
        assert!(swept.is_empty());
        let still = engine.get_task(&queue_id, &task.task_id).await.unwrap();
        assert_eq!(still.status, TaskState::Running);
    }

    #[tokio::test]
    async fn task_timeout_fails_despite_regular_heartbeats() {
        let (engine, queue_id) = engine_with_queue().await;
        let task = engine
            .submit_task(
                &queue_id,
                SubmitTask {
                    heartbeat_timeout: Some(600.0),
                    task_timeout: Some(0),
                    max_retries: Some(3),
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
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        engine
            .refresh_task_heartbeat(&queue_id, &task.task_id)
            .await
            .unwrap();

        engine.handle_timeouts(&queue_id).await.unwrap();
        let failed = engine.get_task(&queue_id, &task.task_id).await.unwrap();
        // hard cap: failed unconditionally even with retry budget left
        assert_eq!(failed.status, TaskState::Failed);
        assert_eq!(failed.retries, 0);
    }

    #[tokio::test]
    async fn timeouts_count_against_the_worker() {
        let (engine, queue_id) = engine_with_queue().await;
        let worker = engine
            .create_worker(
                &queue_id,
                CreateWorker {
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine
            .submit_task(&queue_id, short_heartbeat(3))
            .await
            .unwrap();
        engine
            .fetch_task(&queue_id, FetchRequest::for_worker(&worker.worker_id))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(80)).await;
        engine.handle_timeouts(&queue_id).await.unwrap();

        let crashed = engine.get_worker(&queue_id, &worker.worker_id).await.unwrap();
        assert_eq!(crashed.status, WorkerState::Crashed);
        assert_eq!(crashed.retries, 1);

        // the crash shows up in the journal as a worker transition
        let events = engine.replay_events(&queue_id, 0).await.unwrap();
        let kinds: Vec<(String, String)> = events
            .iter()
            .map(|e| {
                let crate::model::EventPayload::StateTransition(t) = &e.event;
                (format!("{:?}", t.entity_type), t.new_state.clone())
            })
            .collect();
        assert!(kinds.contains(&("Worker".to_string(), "crashed".to_string())));
    }

    #[tokio::test]
    async fn sweep_is_idempotent_after_a_report() {
        let (engine, queue_id) = engine_with_queue().await;
        let task = engine
            .submit_task(&queue_id, short_heartbeat(3))
            .await
            .unwrap();
        engine
            .fetch_task(&queue_id, FetchRequest::default())
            .await
            .unwrap()
            .unwrap();
        engine
            .report_task_status(
                &queue_id,
                &task.task_id,
                crate::model::ReportedStatus::Success,
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(80)).await;
        let swept = engine.handle_timeouts(&queue_id).await.unwrap();
        assert!(swept.is_empty());
        let task = engine.get_task(&queue_id, &task.task_id).await.unwrap();
        assert_eq!(task.status, TaskState::Success);
    }

    #[tokio::test]
    async fn sweep_covers_all_queues() {
        let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
        let mut task_ids = Vec::new();
        for name in ["one", "two"] {
            let queue = engine
                .create_queue(CreateQueue {
                    queue_name: name.into(),
                    password: "pw".into(),
                    metadata: None,
                })
                .await
                .unwrap();
            let task = engine
                .submit_task(&queue.queue_id, short_heartbeat(0))
                .await
                .unwrap();
            engine
                .fetch_task(&queue.queue_id, FetchRequest::default())
                .await
                .unwrap()
                .unwrap();
            task_ids.push((queue.queue_id, task.task_id));
        }

        tokio::time::sleep(StdDuration::from_millis(80)).await;
        let total = engine.sweep_timeouts().await;
        assert_eq!(total, 2);
        for (queue_id, task_id) in task_ids {
            let task = engine.get_task(&queue_id, &task_id).await.unwrap();
            assert_eq!(task.status, TaskState::Failed);
        }
    }
}
