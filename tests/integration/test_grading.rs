//! End-to-end integration tests for lesson grading.
//!
//! These tests run the orchestrator against a real HTTP compile service
//! (a mock served by axum on a local port) and drive it both directly and
//! through the HTTP API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use lesson_machine::Interpreter;
use lesson_orchestrator::{
    create_router, AppState, CompilationGateway, CompilerBackend, CompilerService, Config, Cursor,
    EditResponse, HttpCompiler, InvalidReason, LessonOrchestrator, LessonScript, LessonStatus,
    OrchestratorHandle, OrchestratorOptions, StatusSnapshot,
};
use serde_json::{json, Value};
use tokio::time::timeout;

/// A machine that satisfies the fixture lesson.
const CORRECT_TOGGLE: &str = r#"{
    "id": "toggle",
    "initial": "off",
    "context": { "count": 0 },
    "states": {
        "off": { "on": { "TOGGLE": { "target": "on", "assign": { "count": 1 } } } },
        "on": { "on": { "TOGGLE": "off" } }
    }
}"#;

/// Never updates `count`, so the first case fails on its last step.
const FORGETS_COUNT: &str = r#"{
    "initial": "off",
    "context": { "count": 0 },
    "states": {
        "off": { "on": { "TOGGLE": "on" } },
        "on": { "on": { "TOGGLE": "off" } }
    }
}"#;

/// Cannot leave `on`, so only the second case fails.
const STUCK_ON: &str = r#"{
    "initial": "off",
    "context": { "count": 0 },
    "states": {
        "off": { "on": { "TOGGLE": { "target": "on", "assign": { "count": 1 } } } },
        "on": {}
    }
}"#;

/// Path to the fixtures directory.
fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

fn fixture_lesson() -> Arc<LessonScript> {
    Arc::new(LessonScript::load(fixtures_dir().join("lesson.json")).expect("fixture lesson loads"))
}

fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        throttle: Duration::from_millis(20),
        event_capacity: 100,
    }
}

// ============================================================================
// Mock compile service
// ============================================================================

/// Compiles by parsing the submitted file as JSON; `{"file": "..."}` in,
/// `{"didItWork": ..., "result": ...}` out.
async fn mock_compile(
    State(calls): State<Arc<AtomicUsize>>,
    Json(request): Json<Value>,
) -> Json<Value> {
    calls.fetch_add(1, Ordering::SeqCst);

    let file = request["file"].as_str().unwrap_or_default();
    match serde_json::from_str::<Value>(file) {
        Ok(definition) => Json(json!({ "didItWork": true, "result": definition })),
        Err(_) => Json(json!({ "didItWork": false })),
    }
}

/// Spawns the mock compile service and returns its URL and call counter.
async fn spawn_compile_server() -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/api/compile", post(mock_compile))
        .with_state(Arc::clone(&calls));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    (format!("http://{addr}/api/compile"), calls)
}

fn spawn_orchestrator(compiler_url: &str) -> OrchestratorHandle {
    let gateway = CompilationGateway::new(
        Arc::new(HttpCompiler::new(compiler_url)),
        Arc::new(Interpreter::new()),
    );
    LessonOrchestrator::spawn(fixture_lesson(), gateway, fast_options())
}

async fn grade(orchestrator: &OrchestratorHandle, source: &str) -> StatusSnapshot {
    orchestrator.text_edited(source).expect("orchestrator running");
    timeout(Duration::from_secs(5), orchestrator.settled())
        .await
        .expect("Timeout waiting for settled status")
        .expect("orchestrator running")
}

// ============================================================================
// Fixture Tests
// ============================================================================

/// Tests that the fixture lesson parses into two cases.
#[test]
fn test_fixture_lesson_loads() {
    let script = fixture_lesson();

    assert_eq!(script.title, "Toggle");
    assert_eq!(script.cases.len(), 2);
    assert_eq!(script.total_steps(), 5);
    assert_eq!(
        script.step_at(Cursor::new(1, 1)).map(lesson_orchestrator::Step::label),
        Some("back to off".to_string())
    );
}

/// Tests that the fixture config loads with its overrides applied.
#[test]
fn test_fixture_config_loads() {
    let config = Config::load_from_dir(&fixtures_dir()).expect("fixture config loads");

    assert_eq!(config.lesson, "lesson.json");
    assert_eq!(config.throttle_ms, 25);
    assert_eq!(config.compiler.backend, CompilerBackend::Json);
    assert_eq!(config.event_buffer_size, 64);
    assert_eq!(
        OrchestratorOptions::from(&config).throttle,
        Duration::from_millis(25)
    );
}

// ============================================================================
// HTTP Compiler Tests
// ============================================================================

/// Tests the compile service wire format through the HTTP client.
#[tokio::test]
async fn test_http_compiler_round_trip() {
    let (url, calls) = spawn_compile_server().await;
    let compiler = HttpCompiler::new(&url);

    let response = compiler.compile(CORRECT_TOGGLE).await.expect("compiled");
    assert!(response.did_it_work);
    assert_eq!(response.result.expect("definition")["initial"], "off");

    let response = compiler.compile("not a machine").await.expect("answered");
    assert!(!response.did_it_work);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Grading Tests
// ============================================================================

/// Tests that a correct machine passes every step.
#[tokio::test]
async fn test_correct_machine_passes() {
    let (url, _calls) = spawn_compile_server().await;
    let orchestrator = spawn_orchestrator(&url);

    let status = grade(&orchestrator, CORRECT_TOGGLE).await;

    assert_eq!(status.status, LessonStatus::Passed);
    assert_eq!(status.state, "idle.valid.passed");
    assert!(status.last_errored_step.is_none());
    assert_eq!(status.epoch, 1);
}

/// Tests that the first failing step is reported.
#[tokio::test]
async fn test_failing_machine_reports_first_errored_step() {
    let (url, _calls) = spawn_compile_server().await;
    let orchestrator = spawn_orchestrator(&url);

    let status = grade(&orchestrator, FORGETS_COUNT).await;
    assert_eq!(status.status, LessonStatus::NotPassed);
    assert_eq!(status.last_errored_step, Some(Cursor::new(0, 2)));

    let status = grade(&orchestrator, STUCK_ON).await;
    assert_eq!(status.status, LessonStatus::NotPassed);
    assert_eq!(status.last_errored_step, Some(Cursor::new(1, 1)));
    assert_eq!(status.epoch, 2);
}

/// Tests that a rejected source settles in invalid compile.
#[tokio::test]
async fn test_rejected_source_is_invalid_compile() {
    let (url, calls) = spawn_compile_server().await;
    let orchestrator = spawn_orchestrator(&url);

    let status = grade(&orchestrator, "machine Toggle {").await;

    assert_eq!(status.status, LessonStatus::InvalidCompile);
    assert_eq!(status.invalid_reason, Some(InvalidReason::CompileFailed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Tests that empty source never reaches the compile service.
#[tokio::test]
async fn test_empty_source_skips_compile_service() {
    let (url, calls) = spawn_compile_server().await;
    let orchestrator = spawn_orchestrator(&url);

    let status = grade(&orchestrator, "").await;

    assert_eq!(status.status, LessonStatus::InvalidCompile);
    assert_eq!(status.invalid_reason, Some(InvalidReason::EmptySource));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Tests that an unreachable compile service is treated as a failed compile.
#[tokio::test]
async fn test_unreachable_compiler_is_invalid_compile() {
    // Bind and drop to get a port nothing listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind")
        .local_addr()
        .expect("Failed to get local addr")
        .port();
    let orchestrator = spawn_orchestrator(&format!("http://127.0.0.1:{port}/api/compile"));

    let status = grade(&orchestrator, CORRECT_TOGGLE).await;

    assert_eq!(status.status, LessonStatus::InvalidCompile);
    assert_eq!(status.invalid_reason, Some(InvalidReason::CompileFailed));
}

/// Tests that a burst of edits is graded once, against the last text.
#[tokio::test]
async fn test_burst_of_edits_compiles_last_text_once() {
    let (url, calls) = spawn_compile_server().await;
    let orchestrator = spawn_orchestrator(&url);

    orchestrator.text_edited(FORGETS_COUNT).expect("running");
    orchestrator.text_edited("half typed {").expect("running");
    let status = grade(&orchestrator, CORRECT_TOGGLE).await;

    assert_eq!(status.status, LessonStatus::Passed);
    assert_eq!(status.epoch, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// HTTP API Tests
// ============================================================================

/// Tests grading driven entirely through the HTTP API.
#[tokio::test]
async fn test_edit_and_status_over_http() {
    let (compiler_url, _calls) = spawn_compile_server().await;
    let orchestrator = spawn_orchestrator(&compiler_url);
    let script = fixture_lesson();

    let router = create_router(AppState::new(
        Config::default(),
        orchestrator.clone(),
        &script,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/edit"))
        .json(&json!({ "text": CORRECT_TOGGLE }))
        .send()
        .await
        .expect("edit request");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let edit: EditResponse = response.json().await.expect("edit response");
    assert!(edit.accepted);
    assert_eq!(edit.epoch, 1);

    timeout(Duration::from_secs(5), orchestrator.settled())
        .await
        .expect("Timeout waiting for settled status")
        .expect("orchestrator running");

    let status: StatusSnapshot = client
        .get(format!("http://{addr}/api/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status response");
    assert_eq!(status.status, LessonStatus::Passed);
    assert_eq!(status.epoch, 1);

    let lesson: Value = client
        .get(format!("http://{addr}/api/lesson"))
        .send()
        .await
        .expect("lesson request")
        .json()
        .await
        .expect("lesson response");
    assert_eq!(lesson["title"], "Toggle");
    assert_eq!(lesson["totalSteps"], 5);
}

/// Tests that the instance is gone after shutdown and edits are refused.
#[tokio::test]
async fn test_shutdown_refuses_further_edits() {
    let (url, _calls) = spawn_compile_server().await;
    let orchestrator = spawn_orchestrator(&url);

    grade(&orchestrator, CORRECT_TOGGLE).await;
    orchestrator.shutdown().await.expect("first shutdown");

    assert!(orchestrator.text_edited(CORRECT_TOGGLE).is_err());
    assert!(orchestrator.shutdown().await.is_err());
}
