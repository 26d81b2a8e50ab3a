use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use taskq_core::document::Document;
use taskq_core::store::RecordStore;
use taskq_core::workers::ListWorkers;
use taskq_core::Error;

use crate::auth::AuthedQueue;
use crate::error::ApiError;
use crate::models::{
    WorkerCreateRequest, WorkerCreateResponse, WorkerDeleteQuery, WorkerLsQuery, WorkerLsResponse,
    WorkerResponse, WorkerStatusUpdateRequest,
};
use crate::router::AppState;

pub async fn create_worker<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Json(payload): Json<WorkerCreateRequest>,
) -> Result<(StatusCode, Json<WorkerCreateResponse>), ApiError> {
    let worker = state
        .engine
        .create_worker(queue.queue_id(), payload.into())
        .await
        .map_err(|e| state.err(e))?;
    Ok((
        StatusCode::CREATED,
        Json(WorkerCreateResponse {
            worker_id: worker.worker_id,
        }),
    ))
}

pub async fn ls_workers<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Query(query): Query<WorkerLsQuery>,
) -> Result<Json<WorkerLsResponse>, ApiError> {
    let extra_filter = query
        .extra_filter
        .map(|json| {
            serde_json::from_str::<Document>(&json)
                .map_err(|e| state.err(Error::Validation(format!("invalid extra_filter: {e}"))))
        })
        .transpose()?;
    let workers = state
        .engine
        .list_workers(
            queue.queue_id(),
            ListWorkers {
                offset: query.offset,
                limit: query.limit,
                worker_id: query.worker_id,
                worker_name: query.worker_name,
                extra_filter,
            },
        )
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(WorkerLsResponse {
        found: !workers.is_empty(),
        content: workers.into_iter().map(WorkerResponse::from).collect(),
    }))
}

pub async fn get_worker<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(worker_id): Path<String>,
) -> Result<Json<WorkerResponse>, ApiError> {
    let worker = state
        .engine
        .get_worker(queue.queue_id(), &worker_id)
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(WorkerResponse::from(worker)))
}

pub async fn report_worker_status<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(worker_id): Path<String>,
    Json(payload): Json<WorkerStatusUpdateRequest>,
) -> Result<Json<WorkerResponse>, ApiError> {
    let status = match payload.status.as_str() {
        "active" => taskq_core::model::WorkerReportedStatus::Active,
        "suspended" => taskq_core::model::WorkerReportedStatus::Suspended,
        "failed" => taskq_core::model::WorkerReportedStatus::Failed,
        other => {
            return Err(state.err(Error::Validation(format!(
                "invalid worker status {other:?}: expected active, suspended or failed"
            ))))
        }
    };
    let worker = state
        .engine
        .report_worker_status(queue.queue_id(), &worker_id, status)
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(WorkerResponse::from(worker)))
}

pub async fn delete_worker<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Path(worker_id): Path<String>,
    Query(query): Query<WorkerDeleteQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .delete_worker(queue.queue_id(), &worker_id, query.cascade_update)
        .await
        .map_err(|e| state.err(e))?;
    Ok(StatusCode::NO_CONTENT)
}
