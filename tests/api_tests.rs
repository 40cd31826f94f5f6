mod test_harness;

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Duration as ChronoDuration;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use precheck_server::api::AuthPolicy;
use precheck_server::config::{ApiKey, AuthConfig};
use precheck_server::store::RunStatus;
use test_harness::TestEnv;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(body)
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn from_addr(mut request: Request<Body>, addr: &str) -> Request<Body> {
    let addr: SocketAddr = addr.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn upload_via_api(app: &Router, data: &'static [u8]) -> Value {
    let (status, body) = send_json(
        app,
        post("/api/v1/uploads?name=chip.gds", Body::from(data)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body
}

async fn create_via_api(app: &Router, upload_id: &str) -> Value {
    let (status, body) = send_json(
        app,
        post_json(
            "/api/v1/prechecks",
            json!({"upload_id": upload_id, "top_cell": "chip_top"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

#[tokio::test]
async fn test_health() {
    let env = TestEnv::new(1).await;
    let (status, body) = send_json(&env.app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_upload_and_precheck_flow() {
    let env = TestEnv::new(1).await;
    let app = env.app();

    let upload = upload_via_api(&app, b"layout bytes").await;
    assert_eq!(upload["Name"], "chip.gds");
    assert_eq!(upload["Size"], 12);
    assert_eq!(upload["State"]["Status"], "available");
    assert!(upload["Checksums"]["sha256"].is_string());
    let upload_id = upload["Id"].as_str().unwrap().to_string();

    let run = create_via_api(&app, &upload_id).await;
    let run_id = run["Id"].as_str().unwrap().to_string();
    assert_eq!(run["Name"], format!("precheck-{run_id}"));
    assert_eq!(run["State"]["Status"], "queued");
    assert_eq!(run["State"]["Running"], false);
    assert_eq!(run["Config"]["Labels"]["top_cell"], "chip_top");
    assert_eq!(run["Config"]["Labels"]["die_id"], "FFFFFFFF");
    assert_eq!(run["Queue"]["Position"], 1);
    assert_eq!(run["Queue"]["Length"], 1);
    assert_eq!(run["Input"]["Checksums"], upload["Checksums"]);
    assert_eq!(run["Output"]["Available"], false);

    env.tick().await;
    let (status, run) = send_json(&app, get(&format!("/api/v1/prechecks/{run_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["State"]["Status"], "running");
    assert!(run["Queue"]["Position"].is_null());
    assert!(run["ContainerId"].is_string());

    let handle = run["ContainerId"].as_str().unwrap().to_string();
    env.runtime.complete_with_output(&handle, b"final");
    env.tick().await;

    let (status, waited) = send_json(
        &app,
        post(&format!("/api/v1/prechecks/{run_id}/wait"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(waited["Status"], "completed");
    assert_eq!(waited["StatusCode"], 0);

    let (status, bytes) = send(&app, get(&format!("/api/v1/prechecks/{run_id}/output"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"final");
}

#[tokio::test]
async fn test_output_headers() {
    let env = TestEnv::new(1).await;
    let upload = env.upload(b"layout").await;
    let run = env.queue_run(upload.id).await;
    env.tick().await;
    env.runtime
        .complete_with_output(&TestEnv::handle_of(&env.run(run.id).await), b"out");
    env.tick().await;

    let response = env
        .app()
        .oneshot(get(&format!("/api/v1/prechecks/{}/output", run.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap();
    assert_eq!(disposition, "attachment; filename=\"chip_top.gds\"");

    let response = env
        .app()
        .oneshot(get(&format!("/api/v1/debug/prechecks/{}", run.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/gzip");
}

#[tokio::test]
async fn test_not_found_statuses() {
    let env = TestEnv::new(1).await;
    let app = env.app();
    let missing = uuid::Uuid::new_v4();

    let (status, body) = send_json(&app, get(&format!("/api/v1/prechecks/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains(&missing.to_string()));

    let (status, _) = send_json(&app, get(&format!("/api/v1/uploads/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        &app,
        post_json(
            "/api/v1/prechecks",
            json!({"upload_id": missing, "top_cell": "chip_top"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_expired_upload_is_bad_request() {
    let env = TestEnv::new(1).await;
    let app = env.app();
    let upload = upload_via_api(&app, b"layout").await;
    env.clock.advance(ChronoDuration::minutes(16));

    let (status, body) = send_json(&app, get(&format!("/api/v1/uploads/{}", upload["Id"].as_str().unwrap()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["State"]["Status"], "expired");

    let (status, _) = send_json(
        &app,
        post_json(
            "/api/v1/prechecks",
            json!({"upload_id": upload["Id"], "top_cell": "chip_top"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_state_errors_map_to_statuses() {
    let env = TestEnv::new(1).await;
    let app = env.app();
    let upload = env.upload(b"layout").await;
    let run = env.queue_run(upload.id).await;
    let id = run.id;

    // stats and output before the run is running/completed
    let (status, _) = send_json(&app, get(&format!("/api/v1/prechecks/{id}/stats"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send_json(&app, get(&format!("/api/v1/prechecks/{id}/output"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // deleting an active run without force
    let (status, _) = send_json(&app, delete(&format!("/api/v1/prechecks/{id}"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // zero-second wait on a queued run
    let (status, body) = send_json(
        &app,
        post(&format!("/api/v1/prechecks/{id}/wait?timeout=0"), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert!(body["message"].as_str().unwrap().contains("queued"));

    let (status, _) = send_json(&app, delete(&format!("/api/v1/prechecks/{id}?force=true"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(env.service.get_run(id).await.is_err());
}

#[tokio::test]
async fn test_completed_without_output_is_not_found() {
    let env = TestEnv::new(1).await;
    let upload = env.upload(b"layout").await;
    let run = env.queue_run(upload.id).await;
    env.tick().await;
    env.runtime
        .exit(&TestEnv::handle_of(&env.run(run.id).await), 0);
    env.tick().await;

    let (status, body) =
        send_json(&env.app(), get(&format!("/api/v1/prechecks/{}", run.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["State"]["OutputMissing"], true);

    let (status, _) =
        send_json(&env.app(), get(&format!("/api/v1/prechecks/{}/output", run.id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_runtime_failure_is_bad_gateway() {
    let env = TestEnv::new(1).await;
    let upload = env.upload(b"layout").await;
    let run = env.queue_run(upload.id).await;
    env.tick().await;
    env.runtime.set_stop_failing(true);

    let (status, _) = send_json(
        &env.app(),
        post(&format!("/api/v1/prechecks/{}/cancel", run.id), Body::empty()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(env.run(run.id).await.status, RunStatus::Running);
}

#[tokio::test]
async fn test_create_precheck_validation() {
    let env = TestEnv::new(1).await;
    let app = env.app();
    let upload = env.upload(b"layout").await;

    let (status, _) = send_json(
        &app,
        post_json(
            "/api/v1/prechecks",
            json!({"upload_id": upload.id, "top_cell": ""}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // malformed body is rejected by the extractor
    let (status, _) = send(
        &app,
        post_json("/api/v1/prechecks", json!({"top_cell": "chip_top"})),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_list_prechecks_with_status_filter() {
    let env = TestEnv::new(1).await;
    let app = env.app();
    let upload = env.upload(b"layout").await;
    let first = env.queue_run(upload.id).await;
    let second = env.queue_run(upload.id).await;
    env.tick().await;

    let (status, all) = send_json(&app, get("/api/v1/prechecks")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = all
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["Id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![second.id.to_string(), first.id.to_string()]);

    let (_, queued) = send_json(&app, get("/api/v1/prechecks?status=queued")).await;
    let queued = queued.as_array().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["Id"], second.id.to_string());

    let (_, both) = send_json(&app, get("/api/v1/prechecks?status=queued,running")).await;
    assert_eq!(both.as_array().unwrap().len(), 2);

    let (status, _) = send_json(&app, get("/api/v1/prechecks?status=paused")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_queue_status() {
    let env = TestEnv::new(1).await;
    let upload = env.upload(b"layout").await;
    env.queue_run(upload.id).await;
    env.queue_run(upload.id).await;
    env.tick().await;

    let (status, body) = send_json(&env.app(), get("/api/v1/queue")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], 1);
    assert_eq!(body["running"], 1);
    assert_eq!(body["max_concurrent"], 1);
}

#[tokio::test]
async fn test_logs_endpoint() {
    let env = TestEnv::new(1).await;
    let upload = env.upload(b"layout").await;
    let run = env.queue_run(upload.id).await;

    let (status, body) = send_json(
        &env.app(),
        get(&format!("/api/v1/prechecks/{}/logs?tail=10", run.id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lines"], json!([]));
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn test_delete_upload_endpoint() {
    let env = TestEnv::new(1).await;
    let app = env.app();
    let upload = env.upload(b"layout").await;

    let (status, body) = send_json(&app, delete(&format!("/api/v1/uploads/{}", upload.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Upload deleted");

    let (_, list) = send_json(&app, get("/api/v1/uploads")).await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn test_admin_orphans() {
    let env = TestEnv::new(1).await;
    let app = env.app();
    env.runtime.add_orphan("precheck-stale");

    let (status, body) = send_json(&app, get("/api/v1/admin/orphans")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "precheck-stale");

    let (status, body) = send_json(&app, post("/api/v1/admin/orphans/cleanup", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], json!(["precheck-stale"]));
    assert_eq!(env.runtime.container_count(), 0);
}

// =============================================================================
// Authentication
// =============================================================================

fn locked_down() -> AuthPolicy {
    AuthPolicy::from_config(&AuthConfig {
        required: true,
        allowed_ips: vec!["10.0.0.0/8".to_string()],
        api_keys: vec![ApiKey {
            name: "ci".to_string(),
            key: "s3cret".to_string(),
        }],
    })
    .unwrap()
}

#[tokio::test]
async fn test_disallowed_address_is_forbidden() {
    let env = TestEnv::new(1).await;
    let app = env.app_with_auth(locked_down());

    let request = from_addr(get("/api/v1/queue"), "192.168.1.5:5000");
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Forbidden: IP 192.168.1.5 not allowed");
}

#[tokio::test]
async fn test_api_key_required() {
    let env = TestEnv::new(1).await;
    let app = env.app_with_auth(locked_down());

    let request = from_addr(get("/api/v1/queue"), "10.1.2.3:5000");
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized: API key required");

    let mut request = from_addr(get("/api/v1/queue"), "10.1.2.3:5000");
    request
        .headers_mut()
        .insert("x-api-key", "wrong".parse().unwrap());
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized: Invalid API key");

    let mut request = from_addr(get("/api/v1/queue"), "10.1.2.3:5000");
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
    let (status, _) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_exempt_from_auth() {
    let env = TestEnv::new(1).await;
    let app = env.app_with_auth(locked_down());

    let request = from_addr(get("/health"), "192.168.1.5:5000");
    let (status, _) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}
