use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Latency buckets sized for queue traffic: most calls are one or two store
/// round-trips, with a tail for claim races and cold connection pools.
const LATENCY_SECONDS: &[f64] = &[0.001, 0.005, 0.02, 0.1, 0.5, 2.0, 10.0];

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_SECONDS)
        .expect("non-empty bucket list")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Per-route request counter and latency histogram. Uses the matched route
/// template rather than the raw path, so task and worker ids don't explode
/// the label space.
pub async fn track_requests(request: Request<Body>, next: Next) -> impl IntoResponse {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    let started = Instant::now();
    let response = next.run(request).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("taskq_http_requests_total", &labels).increment(1);
    metrics::histogram!("taskq_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
