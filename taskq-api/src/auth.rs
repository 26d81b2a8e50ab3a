//! Basic authentication: `(queue_name, password)` resolved to a verified
//! queue record before any scoped handler runs.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;

use taskq_core::model::QueueRecord;
use taskq_core::store::RecordStore;

use crate::router::AppState;

/// The caller's queue, injected into request extensions by the middleware.
/// Opaque to the engine beyond `queue_id`.
#[derive(Clone)]
pub struct AuthedQueue(pub Arc<QueueRecord>);

impl AuthedQueue {
    pub fn queue_id(&self) -> &str {
        &self.0.queue_id
    }
}

pub async fn authenticate<S: RecordStore>(
    State(state): State<AppState<S>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some((queue_name, password)) = basic_credentials(request.headers().get(AUTHORIZATION))
    else {
        return state.err(taskq_core::Error::Auth).into_response();
    };
    match state.engine.verify_queue(&queue_name, &password).await {
        Ok(queue) => {
            request.extensions_mut().insert(AuthedQueue(Arc::new(queue)));
            next.run(request).await
        }
        Err(err) => state.err(err).into_response(),
    }
}

fn basic_credentials(header: Option<&HeaderValue>) -> Option<(String, String)> {
    let value = header?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, password) = decoded.split_once(':')?;
    Some((name.to_string(), password.to_string()))
}

/// Build the header value clients send; also used by the tests.
pub fn basic_auth_header(queue_name: &str, password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{queue_name}:{password}"));
    format!("Basic {encoded}")
}
