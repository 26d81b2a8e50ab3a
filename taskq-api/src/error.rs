use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_derive::Serialize;
use tracing::error;

use taskq_core::Error as CoreError;

/// Every error body carries `{detail}`.
#[derive(Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Engine errors mapped onto the wire, with internal detail withheld for
/// store failures unless the server runs with unsafe behavior enabled.
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn from_core(err: CoreError, allow_unsafe: bool) -> Self {
        let status = match &err {
            CoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Auth => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidStateTransition(_)
            | CoreError::Conflict(_)
            | CoreError::QueueExists(_)
            | CoreError::QueueNotEmpty => StatusCode::CONFLICT,
            CoreError::StoreTransient(_) | CoreError::StoreFatal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {err}");
            if allow_unsafe {
                err.to_string()
            } else {
                "internal server error".to_string()
            }
        } else {
            err.to_string()
        };
        ApiError { status, detail }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}
