//! Record types for the four logical collections (`queues`, `tasks`,
//! `workers`, `events`) and the state enums of the task and worker machines.
//!
//! Timestamps are stored with millisecond resolution (epoch millis in the
//! document form) so both store backends can compare and sort them
//! numerically.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::document::Document;
use crate::error::Error;

/// Task priority is an int, higher is dispatched earlier.
pub mod priority {
    pub const LOW: i32 = 0;
    pub const MEDIUM: i32 = 10;
    pub const HIGH: i32 = 20;
}

/// Generate a fresh opaque identifier for a record.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Enumeration of possible statuses for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in the queue to be picked up by a worker.
    Pending,
    /// Claimed by a worker and currently being executed.
    Running,
    /// Reported successfully completed.
    Success,
    /// Failed with no retry budget left.
    Failed,
    /// Cancelled by a submitter or worker.
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    /// Terminal states are absorbing: no transition may leave them short of
    /// an explicit admin reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal status a worker may report for a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Success,
    Failed,
    Cancelled,
}

impl FromStr for ReportedStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ReportedStatus::Success),
            "failed" => Ok(ReportedStatus::Failed),
            "cancelled" => Ok(ReportedStatus::Cancelled),
            other => Err(Error::Validation(format!(
                "invalid reported status {other:?}: expected success, failed or cancelled"
            ))),
        }
    }
}

/// Enumeration of possible statuses for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Eligible to fetch tasks.
    Active,
    /// Suspended by an operator; fetches are refused.
    Suspended,
    /// Marked failed by an operator.
    Failed,
    /// Automatically suspended after too many consecutive task failures.
    Crashed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Active => "active",
            WorkerState::Suspended => "suspended",
            WorkerState::Failed => "failed",
            WorkerState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status an operator may report for a worker. `crashed` is only ever
/// entered automatically by the retry accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerReportedStatus {
    Active,
    Suspended,
    Failed,
}

impl From<WorkerReportedStatus> for WorkerState {
    fn from(status: WorkerReportedStatus) -> Self {
        match status {
            WorkerReportedStatus::Active => WorkerState::Active,
            WorkerReportedStatus::Suspended => WorkerState::Suspended,
            WorkerReportedStatus::Failed => WorkerState::Failed,
        }
    }
}

/// A named, password-protected namespace of tasks and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    #[serde(rename = "_id")]
    pub queue_id: String,
    pub queue_name: String,
    pub password_hash: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Document,
}

/// One unit of work with parameters, priority, retry budget, and a lifecycle
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "_id")]
    pub task_id: String,
    pub queue_id: String,
    #[serde(default)]
    pub task_name: Option<String>,
    pub status: TaskState,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Set once the task first enters running, kept across requeues.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    /// Only meaningful while running; reset on each running entry.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
    /// Seconds without a heartbeat before the reaper intervenes.
    pub heartbeat_timeout: f64,
    /// Optional wall-clock cap (seconds) once running.
    #[serde(default)]
    pub task_timeout: Option<i64>,
    pub max_retries: u32,
    pub retries: u32,
    pub priority: i32,
    #[serde(default)]
    pub metadata: Document,
    #[serde(default)]
    pub args: Document,
    /// A command string or argv sequence, opaque to the server.
    #[serde(default)]
    pub cmd: Value,
    /// Filled in by workers on termination.
    #[serde(default)]
    pub summary: Document,
    /// The current holder; set iff status is running.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// A registered executor identity: the source of heartbeats and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    #[serde(rename = "_id")]
    pub worker_id: String,
    pub queue_id: String,
    #[serde(default)]
    pub worker_name: Option<String>,
    pub status: WorkerState,
    #[serde(default)]
    pub metadata: Document,
    /// Consecutive failure count; reset on a successful report.
    pub retries: u32,
    pub max_retries: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Task,
    Worker,
}

/// The payload of a journal entry, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    StateTransition(StateTransitionEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionEvent {
    pub queue_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub old_state: String,
    pub new_state: String,
    /// Snapshot of the entity at the transition.
    pub entity_data: Document,
    /// Transition context, e.g. the timeout reason.
    #[serde(default)]
    pub metadata: Document,
}

/// A committed journal entry as stored in the `events` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "_id")]
    pub event_id: String,
    pub queue_id: String,
    /// Monotone and gap-free within a queue, starting at 1.
    pub sequence: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub event: EventPayload,
}

/// What subscribers and `replay` receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub event: EventPayload,
}

impl From<EventRecord> for EventEnvelope {
    fn from(record: EventRecord) -> Self {
        EventEnvelope {
            sequence: record.sequence,
            timestamp: record.timestamp,
            event: record.event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_state_round_trips_lowercase() {
        assert_eq!(serde_json::to_value(TaskState::Pending).unwrap(), json!("pending"));
        let state: TaskState = serde_json::from_value(json!("cancelled")).unwrap();
        assert_eq!(state, TaskState::Cancelled);
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn event_payload_is_tagged() {
        let event = EventPayload::StateTransition(StateTransitionEvent {
            queue_id: "q".into(),
            timestamp: Utc::now(),
            entity_type: EntityType::Task,
            entity_id: "t".into(),
            old_state: "pending".into(),
            new_state: "running".into(),
            entity_data: Document::new(),
            metadata: Document::new(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("state_transition"));
        assert_eq!(value["entity_type"], json!("task"));
    }

    #[test]
    fn timestamps_serialize_as_epoch_millis() {
        let record = QueueRecord {
            queue_id: "q".into(),
            queue_name: "main".into(),
            password_hash: "h".into(),
            created_at: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            last_modified: DateTime::from_timestamp_millis(1_700_000_000_456).unwrap(),
            metadata: Document::new(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["created_at"], json!(1_700_000_000_123_i64));
        assert_eq!(value["_id"], json!("q"));
    }
}
