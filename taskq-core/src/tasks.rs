//! Task CRUD: submission, listing, lookup, deletion, and the
//! replace-vs-merge update surface (including the admin reset and the
//! pending-cancel path).

use serde_json::{json, Value};

use crate::document::{deep_merge, from_document, to_document, Document};
use crate::engine::{id_scope, load_task, now_ms, snapshot, transition_event, Engine};
use crate::error::{Error, Result};
use crate::filter::{and, filter_from, Filter};
use crate::journal::append_event;
use crate::model::{new_id, priority, EntityType, TaskRecord, TaskState};
use crate::store::{Collection, FindOptions, Patch, RecordStore, SortOrder, StoreSession};
use crate::validation::{validate_name, validate_non_negative, validate_optional_keys};

pub const DEFAULT_TASK_MAX_RETRIES: u32 = 3;
pub const LIST_LIMIT_DEFAULT: usize = 100;
pub const LIST_LIMIT_MAX: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct SubmitTask {
    pub task_name: Option<String>,
    pub args: Option<Document>,
    pub metadata: Option<Document>,
    pub cmd: Option<Value>,
    pub heartbeat_timeout: Option<f64>,
    pub task_timeout: Option<i64>,
    pub max_retries: Option<u32>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ListTasks {
    pub offset: usize,
    pub limit: Option<usize>,
    pub task_id: Option<String>,
    pub task_name: Option<String>,
    pub extra_filter: Option<Filter>,
}

/// A task update request. Top-level fields named in `replace_fields` are
/// overwritten wholesale; every other supplied field deep-merges into the
/// existing record.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub replace_fields: Vec<String>,
    pub status: Option<TaskState>,
    pub task_name: Option<String>,
    pub heartbeat_timeout: Option<f64>,
    pub task_timeout: Option<i64>,
    pub max_retries: Option<u32>,
    pub retries: Option<u32>,
    pub priority: Option<i32>,
    pub metadata: Option<Document>,
    pub args: Option<Document>,
    pub cmd: Option<Value>,
    pub summary: Option<Document>,
}

fn validate_cmd(cmd: Option<&Value>) -> Result<()> {
    match cmd {
        None | Some(Value::String(_)) => Ok(()),
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => Ok(()),
        Some(other) => Err(Error::Validation(format!(
            "cmd must be a string or a list of strings, got {other}"
        ))),
    }
}

fn validate_timeout_secs(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::Validation(format!(
            "{field} must be a positive number of seconds"
        )));
    }
    Ok(())
}

fn apply_doc_field(
    target: &mut Document,
    field: &str,
    incoming: Option<Document>,
    replace_fields: &[String],
) {
    let Some(incoming) = incoming else { return };
    if replace_fields.iter().any(|f| f == field) {
        *target = incoming;
    } else {
        deep_merge(target, &incoming);
    }
}

impl<S: RecordStore> Engine<S> {
    pub async fn submit_task(&self, queue_id: &str, request: SubmitTask) -> Result<TaskRecord> {
        if let Some(name) = &request.task_name {
            validate_name("task", name)?;
        }
        validate_optional_keys(request.args.as_ref())?;
        validate_optional_keys(request.metadata.as_ref())?;
        validate_cmd(request.cmd.as_ref())?;
        let heartbeat_timeout = request
            .heartbeat_timeout
            .unwrap_or_else(|| self.default_heartbeat_timeout());
        validate_timeout_secs("heartbeat_timeout", heartbeat_timeout)?;
        if let Some(task_timeout) = request.task_timeout {
            validate_non_negative("task_timeout", task_timeout)?;
        }
        let priority = request.priority.unwrap_or(priority::MEDIUM);
        validate_non_negative("priority", i64::from(priority))?;

        let now = now_ms();
        let record = TaskRecord {
            task_id: new_id(),
            queue_id: queue_id.to_string(),
            task_name: request.task_name,
            status: TaskState::Pending,
            created_at: now,
            start_time: None,
            last_heartbeat: None,
            last_modified: now,
            heartbeat_timeout,
            task_timeout: request.task_timeout,
            max_retries: request.max_retries.unwrap_or(DEFAULT_TASK_MAX_RETRIES),
            retries: 0,
            priority,
            metadata: request.metadata.unwrap_or_default(),
            args: request.args.unwrap_or_default(),
            cmd: request.cmd.unwrap_or(Value::Null),
            summary: Document::new(),
            worker_id: None,
        };
        self.store
            .insert(Collection::Tasks, to_document(&record)?)
            .await?;
        metrics::counter!("taskq_tasks_submitted_total").increment(1);
        Ok(record)
    }

    pub async fn list_tasks(&self, queue_id: &str, request: ListTasks) -> Result<Vec<TaskRecord>> {
        let limit = request.limit.unwrap_or(LIST_LIMIT_DEFAULT);
        if limit > LIST_LIMIT_MAX {
            return Err(Error::Validation(format!(
                "limit must be at most {LIST_LIMIT_MAX}"
            )));
        }

        let mut scoped = filter_from([("queue_id", json!(queue_id))]);
        if let Some(task_id) = request.task_id {
            scoped.insert("_id".into(), json!(task_id));
        }
        if let Some(task_name) = request.task_name {
            scoped.insert("task_name".into(), json!(task_name));
        }
        let filter = and(scoped, request.extra_filter.unwrap_or_default());

        let options = FindOptions {
            limit: Some(limit),
            offset: request.offset,
            sort: vec![("created_at".into(), SortOrder::Asc)],
        };
        self.store
            .find_many(Collection::Tasks, &filter, &options)
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    pub async fn get_task(&self, queue_id: &str, task_id: &str) -> Result<TaskRecord> {
        self.store
            .find_one(Collection::Tasks, &id_scope(queue_id, task_id))
            .await?
            .map(from_document)
            .transpose()?
            .ok_or(Error::NotFound("task"))
    }

    pub async fn delete_task(&self, queue_id: &str, task_id: &str) -> Result<()> {
        let deleted = self
            .store
            .delete_many(Collection::Tasks, &id_scope(queue_id, task_id))
            .await?;
        if deleted == 0 {
            return Err(Error::NotFound("task"));
        }
        Ok(())
    }

    /// Apply a task update. Document fields follow the replace-vs-merge
    /// contract; a `status` change is limited to cancelling a pending task
    /// or resetting a terminal one back to pending, and is journaled like
    /// any other transition.
    pub async fn update_task(
        &self,
        queue_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<TaskRecord> {
        if let Some(name) = &update.task_name {
            validate_name("task", name)?;
        }
        validate_optional_keys(update.args.as_ref())?;
        validate_optional_keys(update.metadata.as_ref())?;
        validate_optional_keys(update.summary.as_ref())?;
        validate_cmd(update.cmd.as_ref())?;
        if let Some(heartbeat_timeout) = update.heartbeat_timeout {
            validate_timeout_secs("heartbeat_timeout", heartbeat_timeout)?;
        }
        if let Some(task_timeout) = update.task_timeout {
            validate_non_negative("task_timeout", task_timeout)?;
        }
        if let Some(priority) = update.priority {
            validate_non_negative("priority", i64::from(priority))?;
        }

        let mut session = self.store.begin(queue_id).await?;
        let mut record = load_task(&mut session, queue_id, task_id).await?;
        let old_state = record.status;
        let now = now_ms();

        if let Some(task_name) = update.task_name {
            record.task_name = Some(task_name);
        }
        if let Some(heartbeat_timeout) = update.heartbeat_timeout {
            record.heartbeat_timeout = heartbeat_timeout;
        }
        if let Some(task_timeout) = update.task_timeout {
            record.task_timeout = Some(task_timeout);
        }
        if let Some(max_retries) = update.max_retries {
            record.max_retries = max_retries;
        }
        if let Some(retries) = update.retries {
            record.retries = retries;
        }
        if let Some(priority) = update.priority {
            record.priority = priority;
        }
        if let Some(cmd) = update.cmd {
            record.cmd = cmd;
        }
        apply_doc_field(&mut record.args, "args", update.args, &update.replace_fields);
        apply_doc_field(
            &mut record.metadata,
            "metadata",
            update.metadata,
            &update.replace_fields,
        );
        apply_doc_field(
            &mut record.summary,
            "summary",
            update.summary,
            &update.replace_fields,
        );
        if record.retries > record.max_retries {
            return Err(Error::Validation(format!(
                "retries ({}) cannot exceed max_retries ({})",
                record.retries, record.max_retries
            )));
        }

        let mut status_changed = false;
        if let Some(target) = update.status {
            if target != old_state {
                match (old_state, target) {
                    (TaskState::Pending, TaskState::Cancelled) => {}
                    // explicit admin reset out of a terminal state
                    (from, TaskState::Pending) if from.is_terminal() => {
                        record.worker_id = None;
                        record.last_heartbeat = None;
                    }
                    (from, to) => {
                        return Err(Error::InvalidStateTransition(format!(
                            "task update cannot move from {from} to {to}"
                        )));
                    }
                }
                record.status = target;
                status_changed = true;
            }
        }
        record.last_modified = now;

        let mut doc = to_document(&record)?;
        doc.remove("_id");
        let mut patch = Patch::new();
        patch.set = doc;
        // fields the record dropped must not linger in the stored document
        if record.worker_id.is_none() {
            patch = patch.unset("worker_id");
        }
        if record.last_heartbeat.is_none() {
            patch = patch.unset("last_heartbeat");
        }

        let matched = session
            .update_one(Collection::Tasks, &id_scope(queue_id, task_id), &patch)
            .await?;
        if matched == 0 {
            return Err(Error::NotFound("task"));
        }

        let mut published = Vec::new();
        if status_changed {
            let payload = transition_event(
                queue_id,
                now,
                EntityType::Task,
                task_id,
                old_state.as_str(),
                record.status.as_str(),
                snapshot(&record)?,
                Document::new(),
            );
            published.push(append_event(&mut session, queue_id, now, &payload).await?);
        }
        session.commit().await?;
        self.bus.publish(queue_id, &published);
        Ok(record)
    }
}
