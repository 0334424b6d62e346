use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use actix_web::{App, test, web};
use serde_json::{Value, json};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tokio_util::sync::CancellationToken;

use runbox::config::{Config, LimitsConfig};
use runbox::database as db;
use runbox::queue::JobQueue;
use runbox::record::{Constraints, ExecutionRecord, SubmissionRequest};
use runbox::status::Status;
use runbox::routes::submissions::{
    delete_submission_handler, get_submission_handler, post_grading_handler,
    post_submission_handler,
};
use runbox::routes::{get_health_handler, get_workers_handler};
use runbox::webhook::{RetryPolicy, WebhookDispatcher};
use runbox::worker::worker;

// Global counter to ensure unique test database names
static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

struct TestDbGuard {
    db_path: std::path::PathBuf,
}

impl TestDbGuard {
    fn new() -> Self {
        let test_id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let db_path = std::env::temp_dir().join(format!("test_runbox_{test_id}.db"));
        let _ = std::fs::remove_file(&db_path);
        Self { db_path }
    }
}

impl Drop for TestDbGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path.display()));
    }
}

fn test_config(limits: Value, features: Value) -> Arc<Config> {
    let config = json!({
        "server": {},
        "limits": limits,
        "features": features,
        "languages": [
            {
                "id": 46,
                "name": "Bash (5.2)",
                "source_file": "script.sh",
                "run_cmd": ["/bin/sh", "%SOURCE%"]
            }
        ]
    });
    Arc::new(serde_json::from_value(config).unwrap())
}

struct TestServer {
    config: Arc<Config>,
    pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
    _guard: TestDbGuard,
}

async fn setup(limits: Value, features: Value) -> TestServer {
    let guard = TestDbGuard::new();
    let pool = Arc::new(db::init_db(&guard.db_path).await.unwrap());
    let config = test_config(limits, features);
    let queue = Arc::new(JobQueue::new(config.limits.max_queue_size));
    TestServer {
        config,
        pool,
        queue,
        _guard: guard,
    }
}

macro_rules! init_app {
    ($server:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::from($server.config.clone()))
                .app_data(web::Data::from($server.pool.clone()))
                .app_data(web::Data::from($server.queue.clone()))
                .service(post_submission_handler)
                .service(post_grading_handler)
                .service(get_submission_handler)
                .service(delete_submission_handler)
                .service(get_workers_handler)
                .service(get_health_handler),
        )
        .await
    };
}

fn spawn_worker(server: &TestServer) -> CancellationToken {
    let cancel = CancellationToken::new();
    let webhooks = Arc::new(WebhookDispatcher::new(
        RetryPolicy::new(1, Duration::from_millis(10)),
        false,
    ));
    tokio::spawn(worker(
        1,
        server.config.clone(),
        server.pool.clone(),
        server.queue.clone(),
        webhooks,
        cancel.clone(),
    ));
    cancel
}

async fn count_submissions(pool: &SqlitePool) -> i64 {
    sqlx::query("SELECT COUNT(*) AS count FROM submissions")
        .fetch_one(pool)
        .await
        .unwrap()
        .try_get("count")
        .unwrap()
}

#[actix_web::test]
async fn test_create_submission_is_queued() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);

    let req = test::TestRequest::post()
        .uri("/submissions")
        .set_json(json!({ "source_code": "echo hi", "language_id": 46 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let body: Value = test::read_body_json(resp).await;
    let token = body["token"].as_str().unwrap().to_string();

    let record = db::fetch_record(&token, server.pool.clone()).await.unwrap();
    assert_eq!(record.status.id(), 1);
    assert!(!record.queued_at.is_empty());
    assert!(record.finished_at.is_none());
}

#[actix_web::test]
async fn test_tokens_are_unique() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);

    let mut tokens = Vec::new();
    for _ in 0..3 {
        let req = test::TestRequest::post()
            .uri("/submissions")
            .set_json(json!({ "source_code": "echo hi", "language_id": 46 }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        tokens.push(body["token"].as_str().unwrap().to_string());
    }

    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 3);
}

#[actix_web::test]
async fn test_unknown_language_is_rejected() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);

    let req = test::TestRequest::post()
        .uri("/submissions")
        .set_json(json!({ "source_code": "echo hi", "language_id": 999 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    let body: Value = test::read_body_json(resp).await;
    let fields: Vec<_> = body["violations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"language_id"));
    assert_eq!(count_submissions(&server.pool).await, 0);
}

#[actix_web::test]
async fn test_full_queue_rejects_and_rolls_back() {
    let server = setup(json!({ "max_queue_size": 1 }), json!({})).await;
    let app = init_app!(server);

    let req = test::TestRequest::post()
        .uri("/submissions")
        .set_json(json!({ "source_code": "echo hi", "language_id": 46 }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::post()
        .uri("/submissions")
        .set_json(json!({ "source_code": "echo hi", "language_id": 46 }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 503);

    // The rejected submission must not linger in the store
    assert_eq!(count_submissions(&server.pool).await, 1);
}

#[actix_web::test]
async fn test_maintenance_mode_rejects() {
    let server = setup(json!({}), json!({ "maintenance_mode": true })).await;
    let app = init_app!(server);

    let req = test::TestRequest::post()
        .uri("/submissions")
        .set_json(json!({ "source_code": "echo hi", "language_id": 46 }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 503);
    assert_eq!(count_submissions(&server.pool).await, 0);
}

#[actix_web::test]
async fn test_get_unknown_token_is_404() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);

    let req = test::TestRequest::get()
        .uri("/submissions/no-such-token")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
async fn test_delete_is_feature_gated() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);

    let req = test::TestRequest::delete()
        .uri("/submissions/whatever")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_web::test]
async fn test_delete_requires_terminal_status() {
    let server = setup(json!({}), json!({ "enable_delete": true })).await;
    let app = init_app!(server);

    let req = test::TestRequest::post()
        .uri("/submissions")
        .set_json(json!({ "source_code": "echo hi", "language_id": 46 }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let token = body["token"].as_str().unwrap();

    // Still queued, nothing is processing it in this test
    let req = test::TestRequest::delete()
        .uri(&format!("/submissions/{token}"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::delete()
        .uri("/submissions/no-such-token")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
async fn test_wait_mode_runs_to_accepted() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);
    let cancel = spawn_worker(&server);

    let req = test::TestRequest::post()
        .uri("/submissions?wait=true")
        .set_json(json!({
            "source_code": "echo 2",
            "language_id": 46,
            "expected_output": "2"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"]["id"], 3);
    assert_eq!(body["stdout"], "2\n");
    assert!(body["finished_at"].is_string());

    let token = body["token"].as_str().unwrap();
    let record = db::fetch_record(token, server.pool.clone()).await.unwrap();
    assert_eq!(record.status.id(), 3);
    assert!(record.finished_at.is_some());

    cancel.cancel();
}

#[actix_web::test]
async fn test_wait_mode_long_run_is_tle() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);
    let cancel = spawn_worker(&server);

    let req = test::TestRequest::post()
        .uri("/submissions?wait=true")
        .set_json(json!({
            "source_code": "sleep 10",
            "language_id": 46,
            "cpu_time_limit": 1.0
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"]["id"], 5);
    assert!(body["wall_time"].as_f64().unwrap() >= 1.0);

    cancel.cancel();
}

#[actix_web::test]
async fn test_wait_mode_honors_base64_flag() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);
    let cancel = spawn_worker(&server);

    let req = test::TestRequest::post()
        .uri("/submissions?wait=true&base64_encoded=true")
        .set_json(json!({
            "source_code": "ZWNobyAy", // "echo 2"
            "language_id": 46
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"]["id"], 3);
    // "2\n", transport-encoded like a GET with the same flag
    assert_eq!(body["stdout"], "Mgo=");

    cancel.cancel();
}

#[actix_web::test]
async fn test_terminal_save_never_regresses_streamed_progress() {
    let guard = TestDbGuard::new();
    let pool = Arc::new(db::init_db(&guard.db_path).await.unwrap());

    let req: SubmissionRequest = serde_json::from_value(json!({
        "source_code": "x",
        "language_id": 46,
        "test_cases": [
            { "expected_output": "1" },
            { "expected_output": "2" },
            { "expected_output": "3" }
        ]
    }))
    .unwrap();
    let mut record = ExecutionRecord::new(
        &req,
        Constraints::from_request(&req, &LimitsConfig::default()),
        Some(1),
    );
    db::create_record(&record, pool.clone()).await.unwrap();
    assert!(
        db::claim_for_processing(&record.token, "test-host", pool.clone())
            .await
            .unwrap()
    );

    // Two cases already streamed their completion to the store
    db::update_progress(&record.token, 2, 3, pool.clone())
        .await
        .unwrap();

    // Terminal write from an in-memory record whose counters never advanced,
    // as happens when the engine fails mid-run
    record.status = Status::BoxError;
    record.message = Some("execution failed: sandbox setup".to_string());
    record.finished_at = Some(runbox::create_timestamp());
    if let Some(grading) = &mut record.grading {
        grading.progress.record_error("execution failed");
    }
    db::save_result(&record, pool.clone()).await.unwrap();

    let fetched = db::fetch_record(&record.token, pool.clone()).await.unwrap();
    let progress = &fetched.grading.as_ref().unwrap().progress;
    assert_eq!(progress.done, 2);
    assert_eq!(progress.total, 3);
    assert_eq!(progress.message.as_deref(), Some("execution failed"));
}

#[actix_web::test]
async fn test_grading_runs_all_cases() {
    let server = setup(json!({}), json!({})).await;
    let app = init_app!(server);
    let cancel = spawn_worker(&server);

    let req = test::TestRequest::post()
        .uri("/grading/9?wait=true")
        .set_json(json!({
            "source_code": "cat",
            "language_id": 46,
            "test_cases": [
                { "stdin": "1", "expected_output": "1" },
                { "stdin": "2", "expected_output": "2" }
            ]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"]["id"], 3);
    assert_eq!(body["problem_id"], 9);
    assert_eq!(body["progress"]["done"], 2);
    assert_eq!(body["progress"]["total"], 2);
    let cases = body["test_cases"].as_array().unwrap();
    assert_eq!(cases.len(), 2);
    assert!(cases.iter().all(|c| c["status"]["id"] == 3));

    cancel.cancel();
}

#[actix_web::test]
async fn test_health_reports_queue_state() {
    let server = setup(json!({ "max_queue_size": 4 }), json!({})).await;
    let app = init_app!(server);

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue_depth"], 0);
    assert_eq!(body["queue_max"], 4);
}
