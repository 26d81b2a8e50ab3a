use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::Json;

use taskq_core::store::RecordStore;

use crate::auth::AuthedQueue;
use crate::error::ApiError;
use crate::models::{
    QueueCreateRequest, QueueCreateResponse, QueueDeleteQuery, QueueGetResponse,
    QueueUpdateRequest,
};
use crate::router::AppState;

pub async fn create_queue<S: RecordStore>(
    State(state): State<AppState<S>>,
    Json(payload): Json<QueueCreateRequest>,
) -> Result<(StatusCode, Json<QueueCreateResponse>), ApiError> {
    let queue = state
        .engine
        .create_queue(payload.into())
        .await
        .map_err(|e| state.err(e))?;
    Ok((
        StatusCode::CREATED,
        Json(QueueCreateResponse {
            queue_id: queue.queue_id,
        }),
    ))
}

pub async fn get_queue<S: RecordStore>(
    Extension(queue): Extension<AuthedQueue>,
) -> Json<QueueGetResponse> {
    Json(QueueGetResponse::from((*queue.0).clone()))
}

pub async fn update_queue<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Json(payload): Json<QueueUpdateRequest>,
) -> Result<Json<QueueGetResponse>, ApiError> {
    let updated = state
        .engine
        .update_queue(queue.queue_id(), payload.into())
        .await
        .map_err(|e| state.err(e))?;
    Ok(Json(QueueGetResponse::from(updated)))
}

pub async fn delete_queue<S: RecordStore>(
    State(state): State<AppState<S>>,
    Extension(queue): Extension<AuthedQueue>,
    Query(query): Query<QueueDeleteQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .delete_queue(queue.queue_id(), query.cascade_delete)
        .await
        .map_err(|e| state.err(e))?;
    Ok(StatusCode::NO_CONTENT)
}
