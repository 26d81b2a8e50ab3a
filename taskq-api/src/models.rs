//! Wire models. Records keep their own stored form (epoch-milli
//! timestamps); the API serializes RFC 3339, so requests and responses are
//! separate types converted at the handler boundary.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use taskq_core::document::Document;
use taskq_core::model::{
    EntityType, EventEnvelope, EventPayload, QueueRecord, TaskRecord, TaskState, WorkerRecord,
    WorkerState,
};
use taskq_core::queues::{CreateQueue, QueueUpdate};
use taskq_core::tasks::{SubmitTask, TaskUpdate};
use taskq_core::workers::CreateWorker;

fn default_true() -> bool {
    true
}

// ---- queues ----

#[derive(Debug, Deserialize)]
pub struct QueueCreateRequest {
    pub queue_name: String,
    pub password: String,
    #[serde(default)]
    pub metadata: Option<Document>,
}

impl From<QueueCreateRequest> for CreateQueue {
    fn from(request: QueueCreateRequest) -> Self {
        CreateQueue {
            queue_name: request.queue_name,
            password: request.password,
            metadata: request.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueCreateResponse {
    pub queue_id: String,
}

#[derive(Debug, Serialize)]
pub struct QueueGetResponse {
    pub queue_id: String,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub metadata: Document,
}

impl From<QueueRecord> for QueueGetResponse {
    fn from(record: QueueRecord) -> Self {
        QueueGetResponse {
            queue_id: record.queue_id,
            queue_name: record.queue_name,
            created_at: record.created_at,
            last_modified: record.last_modified,
            metadata: record.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueueUpdateRequest {
    #[serde(default)]
    pub new_queue_name: Option<String>,
    #[serde(default)]
    pub new_password: Option<String>,
    #[serde(default)]
    pub metadata_update: Option<Document>,
}

impl From<QueueUpdateRequest> for QueueUpdate {
    fn from(request: QueueUpdateRequest) -> Self {
        QueueUpdate {
            new_queue_name: request.new_queue_name,
            new_password: request.new_password,
            metadata_update: request.metadata_update,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueueDeleteQuery {
    #[serde(default)]
    pub cascade_delete: bool,
}

// ---- tasks ----

#[derive(Debug, Deserialize)]
pub struct TaskSubmitRequest {
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub args: Option<Document>,
    #[serde(default)]
    pub metadata: Option<Document>,
    #[serde(default)]
    pub cmd: Option<Value>,
    #[serde(default)]
    pub heartbeat_timeout: Option<f64>,
    #[serde(default)]
    pub task_timeout: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl From<TaskSubmitRequest> for SubmitTask {
    fn from(request: TaskSubmitRequest) -> Self {
        SubmitTask {
            task_name: request.task_name,
            args: request.args,
            metadata: request.metadata,
            cmd: request.cmd,
            heartbeat_timeout: request.heartbeat_timeout,
            task_timeout: request.task_timeout,
            max_retries: request.max_retries,
            priority: request.priority,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskSubmitResponse {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub queue_id: String,
    pub task_name: Option<String>,
    pub status: TaskState,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    pub heartbeat_timeout: f64,
    pub task_timeout: Option<i64>,
    pub max_retries: u32,
    pub retries: u32,
    pub priority: i32,
    pub metadata: Document,
    pub args: Document,
    pub cmd: Value,
    pub summary: Document,
    pub worker_id: Option<String>,
}

impl From<TaskRecord> for TaskResponse {
    fn from(record: TaskRecord) -> Self {
        TaskResponse {
            task_id: record.task_id,
            queue_id: record.queue_id,
            task_name: record.task_name,
            status: record.status,
            created_at: record.created_at,
            start_time: record.start_time,
            last_heartbeat: record.last_heartbeat,
            last_modified: record.last_modified,
            heartbeat_timeout: record.heartbeat_timeout,
            task_timeout: record.task_timeout,
            max_retries: record.max_retries,
            retries: record.retries,
            priority: record.priority,
            metadata: record.metadata,
            args: record.args,
            cmd: record.cmd,
            summary: record.summary,
            worker_id: record.worker_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskFetchRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub eta_max: Option<String>,
    #[serde(default = "default_true")]
    pub start_heartbeat: bool,
    #[serde(default)]
    pub required_fields: Option<Vec<String>>,
    #[serde(default)]
    pub extra_filter: Option<Document>,
}

#[derive(Debug, Serialize)]
pub struct TaskFetchResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskResponse>,
}

#[derive(Debug, Deserialize)]
pub struct TaskLsQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    /// JSON-encoded filter document.
    #[serde(default)]
    pub extra_filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskLsResponse {
    pub found: bool,
    pub content: Vec<TaskResponse>,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusUpdateRequest {
    /// One of success, failed, cancelled.
    pub status: String,
    #[serde(default)]
    pub summary: Option<Document>,
}

#[derive(Debug, Deserialize)]
pub struct TaskUpdateRequest {
    #[serde(default)]
    pub replace_fields: Vec<String>,
    #[serde(default)]
    pub status: Option<TaskState>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub heartbeat_timeout: Option<f64>,
    #[serde(default)]
    pub task_timeout: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub metadata: Option<Document>,
    #[serde(default)]
    pub args: Option<Document>,
    #[serde(default)]
    pub cmd: Option<Value>,
    #[serde(default)]
    pub summary: Option<Document>,
}

impl From<TaskUpdateRequest> for TaskUpdate {
    fn from(request: TaskUpdateRequest) -> Self {
        TaskUpdate {
            replace_fields: request.replace_fields,
            status: request.status,
            task_name: request.task_name,
            heartbeat_timeout: request.heartbeat_timeout,
            task_timeout: request.task_timeout,
            max_retries: request.max_retries,
            retries: request.retries,
            priority: request.priority,
            metadata: request.metadata,
            args: request.args,
            cmd: request.cmd,
            summary: request.summary,
        }
    }
}

// ---- workers ----

#[derive(Debug, Deserialize)]
pub struct WorkerCreateRequest {
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub metadata: Option<Document>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl From<WorkerCreateRequest> for CreateWorker {
    fn from(request: WorkerCreateRequest) -> Self {
        CreateWorker {
            worker_name: request.worker_name,
            metadata: request.metadata,
            max_retries: request.max_retries,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerCreateResponse {
    pub worker_id: String,
}

#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub worker_id: String,
    pub queue_id: String,
    pub worker_name: Option<String>,
    pub status: WorkerState,
    pub metadata: Document,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl From<WorkerRecord> for WorkerResponse {
    fn from(record: WorkerRecord) -> Self {
        WorkerResponse {
            worker_id: record.worker_id,
            queue_id: record.queue_id,
            worker_name: record.worker_name,
            status: record.status,
            metadata: record.metadata,
            retries: record.retries,
            max_retries: record.max_retries,
            created_at: record.created_at,
            last_modified: record.last_modified,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkerLsQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub extra_filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkerLsResponse {
    pub found: bool,
    pub content: Vec<WorkerResponse>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerStatusUpdateRequest {
    /// One of active, suspended, failed.
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkerDeleteQuery {
    #[serde(default = "default_true")]
    pub cascade_update: bool,
}

// ---- events ----

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Replay committed events after this sequence before going live.
    #[serde(default)]
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EventSubscriptionResponse {
    pub status: &'static str,
    pub client_id: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventOut {
    StateTransition {
        queue_id: String,
        timestamp: DateTime<Utc>,
        entity_type: EntityType,
        entity_id: String,
        old_state: String,
        new_state: String,
        entity_data: Document,
        metadata: Document,
    },
}

#[derive(Debug, Serialize)]
pub struct EventEnvelopeOut {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: EventOut,
}

impl From<EventEnvelope> for EventEnvelopeOut {
    fn from(envelope: EventEnvelope) -> Self {
        let EventPayload::StateTransition(transition) = envelope.event;
        EventEnvelopeOut {
            sequence: envelope.sequence,
            timestamp: envelope.timestamp,
            event: EventOut::StateTransition {
                queue_id: transition.queue_id,
                timestamp: transition.timestamp,
                entity_type: transition.entity_type,
                entity_id: transition.entity_id,
                old_state: transition.old_state,
                new_state: transition.new_state,
                entity_data: transition.entity_data,
                metadata: transition.metadata,
            },
        }
    }
}
