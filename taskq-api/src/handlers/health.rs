use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use taskq_core::store::RecordStore;

use crate::router::AppState;

/// Basic liveness: the process answers.
pub async fn liveness() -> Json<Value> {
    Json(json!({"connection": "ok"}))
}

/// Full readiness: the store answers a ping and every registered component
/// reported healthy recently.
pub async fn readiness<S: RecordStore>(
    State(state): State<AppState<S>>,
) -> (StatusCode, Json<Value>) {
    match state.engine.store().ping().await {
        Ok(()) => {
            let components = state.liveness.get_status();
            let status = if components.healthy {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let body = json!({
                "status": if components.healthy { "healthy" } else { "unhealthy" },
                "database": "connected",
                "components": components
                    .components
                    .iter()
                    .map(|(name, status)| (name.clone(), Value::String(format!("{status:?}"))))
                    .collect::<serde_json::Map<String, Value>>(),
            });
            (status, Json(body))
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "unhealthy", "database": err.to_string()})),
        ),
    }
}
