//! HTTP-level tests driving the full router over the in-process store.

use std::sync::Arc;

use assert_json_diff::assert_json_include;
use axum::body::Body;
use axum::http::{self, header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt; // for `collect`
use serde_json::{json, Value};
use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

use health::HealthRegistry;
use taskq_api::auth::basic_auth_header;
use taskq_api::router::router;
use taskq_core::engine::EngineConfig;
use taskq_core::store::memory::MemoryStore;
use taskq_core::Engine;

fn app() -> Router {
    let engine = Arc::new(Engine::new(
        Arc::new(MemoryStore::new()),
        EngineConfig::default(),
    ));
    let liveness = HealthRegistry::new("liveness");
    liveness
        .register("reaper".to_string(), chrono::Duration::seconds(60))
        .report_healthy();
    router(engine, liveness, false, false)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(http::Method::GET).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::empty()).unwrap()
}

fn put(uri: &str, auth: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(http::Method::PUT)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, auth)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str, auth: &str) -> Request<Body> {
    Request::builder()
        .method(http::Method::DELETE)
        .uri(uri)
        .header(header::AUTHORIZATION, auth)
        .body(Body::empty())
        .unwrap()
}

async fn create_queue(app: &Router, name: &str) -> String {
    let (status, _) = send(
        app,
        post(
            "/api/v1/queues",
            None,
            json!({"queue_name": name, "password": "pw"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    basic_auth_header(name, "pw")
}

#[tokio::test]
async fn health_endpoints() {
    let app = app();
    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"connection": "ok"}));

    let (status, body) = send(&app, get("/health/full", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["database"], json!("connected"));
}

#[tokio::test]
async fn queue_creation_and_auth() {
    let app = app();
    let auth = create_queue(&app, "main").await;

    // duplicate name conflicts
    let (status, body) = send(
        &app,
        post(
            "/api/v1/queues",
            None,
            json!({"queue_name": "main", "password": "other"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["detail"].as_str().unwrap().contains("main"));

    // malformed name is a validation error
    let (status, _) = send(
        &app,
        post(
            "/api/v1/queues",
            None,
            json!({"queue_name": "bad name", "password": "pw"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // authenticated read
    let (status, body) = send(&app, get("/api/v1/queues/me", Some(&auth))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_name"], json!("main"));

    // wrong password and missing header are unauthorized
    let wrong = basic_auth_header("main", "nope");
    let (status, _) = send(&app, get("/api/v1/queues/me", Some(&wrong))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, get("/api/v1/queues/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn task_round_trip_over_http() {
    let app = app();
    let auth = create_queue(&app, "main").await;

    let (status, body) = send(
        &app,
        post(
            "/api/v1/queues/me/tasks",
            Some(&auth),
            json!({"task_name": "train", "args": {"lr": 0.1}, "cmd": "python train.py"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = body["task_id"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &app,
        post("/api/v1/queues/me/tasks/next", Some(&auth), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["found"], json!(true));
    assert_eq!(body["task"]["task_id"], json!(task_id.clone()));
    assert_eq!(body["task"]["status"], json!("running"));
    assert_eq!(body["task"]["args"], json!({"lr": 0.1}));

    // heartbeat while running
    let (status, _) = send(
        &app,
        post(
            &format!("/api/v1/queues/me/tasks/{task_id}/heartbeat"),
            Some(&auth),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post(
            &format!("/api/v1/queues/me/tasks/{task_id}/status"),
            Some(&auth),
            json!({"status": "success", "summary": {"accuracy": 0.97}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("success"));

    let (status, body) = send(
        &app,
        get(&format!("/api/v1/queues/me/tasks/{task_id}"), Some(&auth)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["worker_id"].is_null());
    assert_json_include!(
        actual: body,
        expected: json!({"status": "success", "summary": {"accuracy": 0.97}})
    );
}

#[tokio::test]
async fn fetch_respects_priority_then_fifo() {
    let app = app();
    let auth = create_queue(&app, "main").await;

    let mut ids = Vec::new();
    for (name, priority) in [("a", 10), ("b", 20), ("c", 20)] {
        let (status, body) = send(
            &app,
            post(
                "/api/v1/queues/me/tasks",
                Some(&auth),
                json!({"task_name": name, "priority": priority}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        ids.push(body["task_id"].as_str().unwrap().to_owned());
    }

    let mut fetched = Vec::new();
    for _ in 0..3 {
        let (_, body) = send(
            &app,
            post("/api/v1/queues/me/tasks/next", Some(&auth), json!({})),
        )
        .await;
        fetched.push(body["task"]["task_id"].as_str().unwrap().to_owned());
    }
    assert_eq!(fetched, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);

    // queue drained
    let (status, body) = send(
        &app,
        post("/api/v1/queues/me/tasks/next", Some(&auth), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["found"], json!(false));
}

#[tokio::test]
async fn invalid_transition_is_a_conflict() {
    let app = app();
    let auth = create_queue(&app, "main").await;

    let (_, body) = send(
        &app,
        post("/api/v1/queues/me/tasks", Some(&auth), json!({})),
    )
    .await;
    let task_id = body["task_id"].as_str().unwrap().to_owned();
    send(
        &app,
        post("/api/v1/queues/me/tasks/next", Some(&auth), json!({})),
    )
    .await;
    let (status, _) = send(
        &app,
        post(
            &format!("/api/v1/queues/me/tasks/{task_id}/status"),
            Some(&auth),
            json!({"status": "success"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // a second terminal report bounces off the absorbing state
    let (status, body) = send(
        &app,
        post(
            &format!("/api/v1/queues/me/tasks/{task_id}/status"),
            Some(&auth),
            json!({"status": "failed"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains("invalid state transition"));

    // the record is unchanged
    let (_, body) = send(
        &app,
        get(&format!("/api/v1/queues/me/tasks/{task_id}"), Some(&auth)),
    )
    .await;
    assert_eq!(body["status"], json!("success"));
}

#[tokio::test]
async fn listing_and_filtering() {
    let app = app();
    let auth = create_queue(&app, "main").await;
    for (name, epochs) in [("small", 1), ("large", 100)] {
        send(
            &app,
            post(
                "/api/v1/queues/me/tasks",
                Some(&auth),
                json!({"task_name": name, "args": {"epochs": epochs}}),
            ),
        )
        .await;
    }

    let (status, body) = send(&app, get("/api/v1/queues/me/tasks", Some(&auth))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["found"], json!(true));
    assert_eq!(body["content"].as_array().unwrap().len(), 2);

    let filter = serde_json::to_string(&json!({"args.epochs": {"$gt": 10}})).unwrap();
    let encoded: String = url_escape(&filter);
    let (status, body) = send(
        &app,
        get(
            &format!("/api/v1/queues/me/tasks?extra_filter={encoded}"),
            Some(&auth),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let content = body["content"].as_array().unwrap();
    assert_eq!(content.len(), 1);
    assert_eq!(content[0]["task_name"], json!("large"));

    let (status, body) = send(
        &app,
        get("/api/v1/queues/me/tasks?task_name=missing", Some(&auth)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["found"], json!(false));
}

// Minimal percent-encoding for the query-string JSON in these tests.
fn url_escape(raw: &str) -> String {
    let mut out = String::new();
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[tokio::test]
async fn task_update_replace_vs_merge() {
    let app = app();
    let auth = create_queue(&app, "main").await;
    let (_, body) = send(
        &app,
        post(
            "/api/v1/queues/me/tasks",
            Some(&auth),
            json!({"args": {"keep": true, "nested": {"a": 1}}}),
        ),
    )
    .await;
    let task_id = body["task_id"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &app,
        put(
            &format!("/api/v1/queues/me/tasks/{task_id}"),
            &auth,
            json!({"args": {"nested": {"b": 2}}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["args"],
        json!({"keep": true, "nested": {"a": 1, "b": 2}})
    );

    let (status, body) = send(
        &app,
        put(
            &format!("/api/v1/queues/me/tasks/{task_id}"),
            &auth,
            json!({"replace_fields": ["args"], "args": {"only": 1}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["args"], json!({"only": 1}));
}

#[tokio::test]
async fn worker_lifecycle_over_http() {
    let app = app();
    let auth = create_queue(&app, "main").await;

    let (status, body) = send(
        &app,
        post(
            "/api/v1/queues/me/workers",
            Some(&auth),
            json!({"worker_name": "gpu-0"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let worker_id = body["worker_id"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &app,
        get(
            &format!("/api/v1/queues/me/workers/{worker_id}"),
            Some(&auth),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("active"));

    // suspend, then fetching with it is refused
    let (status, _) = send(
        &app,
        post(
            &format!("/api/v1/queues/me/workers/{worker_id}/status"),
            Some(&auth),
            json!({"status": "suspended"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    send(
        &app,
        post("/api/v1/queues/me/tasks", Some(&auth), json!({})),
    )
    .await;
    let (status, _) = send(
        &app,
        post(
            "/api/v1/queues/me/tasks/next",
            Some(&auth),
            json!({"worker_id": worker_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        delete(&format!("/api/v1/queues/me/workers/{worker_id}"), &auth),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        get(
            &format!("/api/v1/queues/me/workers/{worker_id}"),
            Some(&auth),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cascade_delete_tears_the_queue_down() {
    let app = app();
    let auth = create_queue(&app, "doomed").await;
    send(
        &app,
        post("/api/v1/queues/me/tasks", Some(&auth), json!({})),
    )
    .await;
    send(
        &app,
        post("/api/v1/queues/me/workers", Some(&auth), json!({})),
    )
    .await;

    // refuses while children exist
    let (status, _) = send(&app, delete("/api/v1/queues/me", &auth)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        delete("/api/v1/queues/me?cascade_delete=true", &auth),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // the queue is gone, so the credentials no longer resolve
    let (status, _) = send(&app, get("/api/v1/queues/me", Some(&auth))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn events_endpoint_opens_a_stream() {
    let app = app();
    let auth = create_queue(&app, "main").await;

    let response = app
        .clone()
        .oneshot(get("/api/v1/queues/me/events", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/event-stream"));
}

#[tokio::test]
async fn bad_json_and_bad_enum_are_client_errors() {
    let app = app();
    let auth = create_queue(&app, "main").await;

    let request = Request::builder()
        .method(http::Method::POST)
        .uri("/api/v1/queues/me/tasks")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, &auth)
        .body(Body::from("not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (_, body) = send(
        &app,
        post("/api/v1/queues/me/tasks", Some(&auth), json!({})),
    )
    .await;
    let task_id = body["task_id"].as_str().unwrap().to_owned();
    let (status, _) = send(
        &app,
        post(
            &format!("/api/v1/queues/me/tasks/{task_id}/status"),
            Some(&auth),
            json!({"status": "exploded"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}
