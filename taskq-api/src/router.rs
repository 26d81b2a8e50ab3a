use std::future::ready;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use taskq_core::store::RecordStore;
use taskq_core::Engine;

use crate::auth;
use crate::error::ApiError;
use crate::handlers;
use crate::metrics::{setup_metrics_recorder, track_requests};

pub struct AppState<S: RecordStore> {
    pub engine: Arc<Engine<S>>,
    pub liveness: HealthRegistry,
    pub allow_unsafe: bool,
}

// Manual impl: `S` itself need not be Clone.
impl<S: RecordStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            engine: self.engine.clone(),
            liveness: self.liveness.clone(),
            allow_unsafe: self.allow_unsafe,
        }
    }
}

impl<S: RecordStore> AppState<S> {
    pub fn err(&self, err: taskq_core::Error) -> ApiError {
        ApiError::from_core(err, self.allow_unsafe)
    }
}

async fn index() -> &'static str {
    "taskq"
}

pub fn router<S: RecordStore>(
    engine: Arc<Engine<S>>,
    liveness: HealthRegistry,
    allow_unsafe: bool,
    metrics: bool,
) -> Router {
    let state = AppState {
        engine,
        liveness,
        allow_unsafe,
    };

    let protected = Router::new()
        .route(
            "/api/v1/queues/me",
            get(handlers::queues::get_queue::<S>)
                .put(handlers::queues::update_queue::<S>)
                .delete(handlers::queues::delete_queue::<S>),
        )
        .route(
            "/api/v1/queues/me/tasks",
            post(handlers::tasks::submit_task::<S>).get(handlers::tasks::ls_tasks::<S>),
        )
        .route(
            "/api/v1/queues/me/tasks/next",
            post(handlers::tasks::fetch_task::<S>),
        )
        .route(
            "/api/v1/queues/me/tasks/:task_id",
            get(handlers::tasks::get_task::<S>)
                .put(handlers::tasks::update_task::<S>)
                .delete(handlers::tasks::delete_task::<S>),
        )
        .route(
            "/api/v1/queues/me/tasks/:task_id/status",
            post(handlers::tasks::report_task_status::<S>),
        )
        .route(
            "/api/v1/queues/me/tasks/:task_id/heartbeat",
            post(handlers::tasks::refresh_task_heartbeat::<S>),
        )
        .route(
            "/api/v1/queues/me/workers",
            post(handlers::workers::create_worker::<S>).get(handlers::workers::ls_workers::<S>),
        )
        .route(
            "/api/v1/queues/me/workers/:worker_id",
            get(handlers::workers::get_worker::<S>)
                .delete(handlers::workers::delete_worker::<S>),
        )
        .route(
            "/api/v1/queues/me/workers/:worker_id/status",
            post(handlers::workers::report_worker_status::<S>),
        )
        .route(
            "/api/v1/queues/me/events",
            get(handlers::events::subscribe::<S>),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate::<S>,
        ));

    let router = Router::new()
        .route("/", get(index))
        .route("/health", get(handlers::health::liveness))
        .route("/health/full", get(handlers::health::readiness::<S>))
        .route("/api/v1/queues", post(handlers::queues::create_queue::<S>))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Don't install the recorder unless asked to: a global recorder does not
    // work when the router is built repeatedly, as in tests.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router
            .route("/metrics", get(move || ready(recorder_handle.render())))
            .layer(middleware::from_fn(track_requests))
    } else {
        router
    }
}
