use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use taskq_core::document::Document;
use taskq_core::model::ReportedStatus;
use taskq_core::store::RecordStore;
use taskq_core::tasks::ListTasks;
use taskq_core::Error;

use crate::auth::AuthedQueue;
use crate::error::ApiError;
use crate::models::{
    TaskFetchRequest, TaskFetchResponse, TaskLsQuery, TaskLsResponse, TaskResponse,
    TaskStatusUpdateRequest, TaskSubmitRequest, TaskSubmitResponse, TaskUpdateRequest,
};
use crate::router::AppState;

/// Query-string filters arrive JSON-encoded.
fn parse_filter<S: RecordStore>(
    state: &AppState<S>,
    raw: Option<String>,
) -> Result<Option<Document>, ApiError> {
    raw.map(|json| {
        serde_json::from_str::<Document>(&json)
            .map_err(|e| state.err(Error::Validation(format!("invalid extra_filter: {e}"))))
    })
    .transpose()
}

pub async fn submit_task<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Json(payload): Json<TaskSubmitRequest>,
) -> Result<(StatusCode, Json<TaskSubmitResponse>), ApiError> {
    let task = state
        .engine
        .submit_task(queue.queue_id(), payload.into())
        .await
        .map_err(|e| state.err(e))?;
    Ok((
        StatusCode::CREATED,
        Json(TaskSubmitResponse {
            task_id: task.task_id,
        }),
    ))
}

pub async fn ls_tasks<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Query(query): Query<TaskLsQuery>,
) -> Result<Json<TaskLsResponse>, ApiError> {
    let extra_filter = parse_filter(&state, query.extra_filter)?;
    let tasks = state
        .engine
        .list_tasks(
            queue.queue_id(),
            ListTasks {
                offset: query.offset,
                limit: query.limit,
                task_id: query.task_id,
                task_name: query.task_name,
                extra_filter,
            },
        )
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(TaskLsResponse {
        found: !tasks.is_empty(),
        content: tasks.into_iter().map(TaskResponse::from).collect(),
    }))
}

/// Claim the next eligible task. Not idempotent: a successful call
/// transitions the returned task to running.
pub async fn fetch_task<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Json(payload): Json<TaskFetchRequest>,
) -> Result<Json<TaskFetchResponse>, ApiError> {
    let claimed = state
        .engine
        .fetch_task(
            queue.queue_id(),
            taskq_core::dispatch::FetchRequest {
                worker_id: payload.worker_id,
                eta_max: payload.eta_max,
                start_heartbeat: payload.start_heartbeat,
                required_fields: payload.required_fields,
                extra_filter: payload.extra_filter,
            },
        )
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(TaskFetchResponse {
        found: claimed.is_some(),
        task: claimed.map(TaskResponse::from),
    }))
}

pub async fn get_task<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .engine
        .get_task(queue.queue_id(), &task_id)
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(TaskResponse::from(task)))
}

pub async fn update_task<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(task_id): Path<String>,
    Json(payload): Json<TaskUpdateRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .engine
        .update_task(queue.queue_id(), &task_id, payload.into())
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(TaskResponse::from(task)))
}

pub async fn delete_task<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .delete_task(queue.queue_id(), &task_id)
        .await
        .map_err(|e| state.err(e))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn report_task_status<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(task_id): Path<String>,
    Json(payload): Json<TaskStatusUpdateRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let status: ReportedStatus = payload
        .status
        .parse()
        .map_err(|e| state.err(e))?;
    let task = state
        .engine
        .report_task_status(queue.queue_id(), &task_id, status, payload.summary)
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(TaskResponse::from(task)))
}

pub async fn refresh_task_heartbeat<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let refreshed = state
        .engine
        .refresh_task_heartbeat(queue.queue_id(), &task_id)
        .await
        .map_err(|e| state.err(e))?;
    if !refreshed {
        return Err(state.err(Error::NotFound("task")));
    }
    Ok(StatusCode::OK)
}
