//! Integration tests for WebSocket real-time event streaming.
//!
//! These tests validate the WebSocket server functionality including
//! connection handling, event broadcasting during a grading run, and
//! concurrent client support.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use lesson_machine::Interpreter;
use lesson_orchestrator::{
    create_router, AppState, CompilationGateway, Config, Cursor, GradingEvent, InvalidReason,
    JsonCompiler, LessonOrchestrator, LessonScript, LessonStatus, OrchestratorHandle,
    OrchestratorOptions,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

const TOGGLE: &str = r#"{
    "initial": "off",
    "context": { "count": 0 },
    "states": {
        "off": { "on": { "TOGGLE": { "target": "on", "assign": { "count": 1 } } } },
        "on": { "on": { "TOGGLE": "off" } }
    }
}"#;

/// Helper to find an available port for testing.
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Helper type for WebSocket client
type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds app state around an orchestrator for the fixture lesson, using the
/// offline JSON compiler.
fn test_state() -> AppState {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/lesson.json");
    let script = Arc::new(LessonScript::load(path).expect("fixture lesson loads"));
    let gateway =
        CompilationGateway::new(Arc::new(JsonCompiler::new()), Arc::new(Interpreter::new()));
    let orchestrator = LessonOrchestrator::spawn(
        Arc::clone(&script),
        gateway,
        OrchestratorOptions {
            throttle: Duration::from_millis(20),
            event_capacity: 100,
        },
    );
    AppState::new(Config::default(), orchestrator, &script)
}

/// Spawns the test server and returns the WebSocket URL.
async fn spawn_test_server(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");
    let ws_url = format!("ws://{addr}/ws");

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (ws_url, handle)
}

/// Connects a WebSocket client to the given URL.
async fn connect_client(url: &str) -> WsClient {
    let (ws_stream, _) = connect_async(url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Receives the next text message from the WebSocket and parses it as a
/// `GradingEvent`. Automatically handles ping frames by responding with pong.
async fn receive_event(client: &mut WsClient) -> GradingEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(data) => {
                // Respond to ping and continue waiting for text message
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) => {
                // Ignore pong messages, continue waiting
            }
            other => panic!("Expected text message, got: {other:?}"),
        }
    }
}

/// Collects events up to and including the first one matching `last`.
async fn receive_until(
    client: &mut WsClient,
    last: impl Fn(&GradingEvent) -> bool,
) -> Vec<GradingEvent> {
    let mut events = Vec::new();
    loop {
        let event = receive_event(client).await;
        let done = last(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

fn submit(orchestrator: &OrchestratorHandle, text: &str) -> u64 {
    orchestrator.text_edited(text).expect("orchestrator running")
}

// ============================================================================
// Connection Tests
// ============================================================================

/// Tests that a WebSocket client receives a connected event on connection.
#[tokio::test]
async fn test_client_receives_connected_event_on_connect() {
    let (ws_url, _handle) = spawn_test_server(test_state()).await;

    let mut client = connect_client(&ws_url).await;
    let event = receive_event(&mut client).await;

    if let GradingEvent::Connected(payload) = event {
        assert_eq!(payload.status.status, LessonStatus::NotPassed);
        assert_eq!(payload.status.state, "idle.valid.notPassed");
        assert_eq!(payload.status.epoch, 0);
    } else {
        panic!("Expected Connected event, got: {event:?}");
    }
}

/// Tests that the connected event reflects a finished run.
#[tokio::test]
async fn test_connected_event_contains_current_status() {
    let state = test_state();
    let orchestrator = state.orchestrator.clone();
    let (ws_url, _handle) = spawn_test_server(state).await;

    submit(&orchestrator, TOGGLE);
    timeout(Duration::from_secs(5), orchestrator.settled())
        .await
        .expect("Timeout waiting for settled status")
        .expect("orchestrator running");

    let mut client = connect_client(&ws_url).await;
    let event = receive_event(&mut client).await;

    if let GradingEvent::Connected(payload) = event {
        assert_eq!(payload.status.status, LessonStatus::Passed);
        assert_eq!(payload.status.epoch, 1);
    } else {
        panic!("Expected Connected event, got: {event:?}");
    }
}

/// Tests that multiple clients can connect concurrently.
#[tokio::test]
async fn test_multiple_clients_can_connect() {
    let (ws_url, _handle) = spawn_test_server(test_state()).await;

    let mut client1 = connect_client(&ws_url).await;
    let mut client2 = connect_client(&ws_url).await;
    let mut client3 = connect_client(&ws_url).await;

    assert!(matches!(receive_event(&mut client1).await, GradingEvent::Connected(_)));
    assert!(matches!(receive_event(&mut client2).await, GradingEvent::Connected(_)));
    assert!(matches!(receive_event(&mut client3).await, GradingEvent::Connected(_)));
}

// ============================================================================
// Grading Event Tests
// ============================================================================

/// Tests that an edit is announced as a transition into throttling.
#[tokio::test]
async fn test_edit_emits_state_changed() {
    let state = test_state();
    let orchestrator = state.orchestrator.clone();
    let (ws_url, _handle) = spawn_test_server(state).await;

    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await; // Consume connected event

    let epoch = submit(&orchestrator, TOGGLE);
    let event = receive_event(&mut client).await;

    if let GradingEvent::StateChanged(payload) = event {
        assert_eq!(payload.from, "idle.valid.notPassed");
        assert_eq!(payload.to, "throttling");
        assert_eq!(payload.epoch, epoch);
    } else {
        panic!("Expected StateChanged event, got: {event:?}");
    }
}

/// Tests that a passing run streams every step and then completes.
#[tokio::test]
async fn test_passing_run_streams_steps_then_completes() {
    let state = test_state();
    let orchestrator = state.orchestrator.clone();
    let (ws_url, _handle) = spawn_test_server(state).await;

    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await; // Consume connected event

    submit(&orchestrator, TOGGLE);
    let events = receive_until(&mut client, |e| matches!(e, GradingEvent::RunComplete(_))).await;

    let steps: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            GradingEvent::StepExecuted(payload) => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(steps.len(), 5);
    assert!(steps.iter().all(|step| step.passed));
    assert_eq!(steps[0].cursor, Cursor::START);
    assert_eq!(steps[0].label, "starts off");
    assert_eq!(steps[4].cursor, Cursor::new(1, 1));

    if let Some(GradingEvent::RunComplete(payload)) = events.last() {
        assert_eq!(payload.status, LessonStatus::Passed);
        assert!(payload.last_errored_step.is_none());
        assert_eq!(payload.epoch, 1);
    } else {
        panic!("Expected RunComplete event last");
    }
}

/// Tests that a failing step ends the run and is reported.
#[tokio::test]
async fn test_failing_run_reports_errored_step() {
    let state = test_state();
    let orchestrator = state.orchestrator.clone();
    let (ws_url, _handle) = spawn_test_server(state).await;

    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await; // Consume connected event

    submit(&orchestrator, &TOGGLE.replace(r#""count": 1"#, r#""count": 2"#));
    let events = receive_until(&mut client, |e| matches!(e, GradingEvent::RunComplete(_))).await;

    let failed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            GradingEvent::StepExecuted(payload) if !payload.passed => Some(payload.cursor),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![Cursor::new(0, 2)]);

    if let Some(GradingEvent::RunComplete(payload)) = events.last() {
        assert_eq!(payload.status, LessonStatus::NotPassed);
        assert_eq!(payload.last_errored_step, Some(Cursor::new(0, 2)));
    } else {
        panic!("Expected RunComplete event last");
    }
}

/// Tests that a source that does not compile emits `compile_failed`.
#[tokio::test]
async fn test_invalid_source_emits_compile_failed() {
    let state = test_state();
    let orchestrator = state.orchestrator.clone();
    let (ws_url, _handle) = spawn_test_server(state).await;

    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await; // Consume connected event

    submit(&orchestrator, "this is not json");
    let events =
        receive_until(&mut client, |e| matches!(e, GradingEvent::CompileFailed(_))).await;

    assert!(events
        .iter()
        .all(|e| !matches!(e, GradingEvent::StepExecuted(_))));
    if let Some(GradingEvent::CompileFailed(payload)) = events.last() {
        assert_eq!(payload.reason, InvalidReason::CompileFailed);
        assert_eq!(payload.epoch, 1);
        assert!(!payload.message.is_empty());
    } else {
        panic!("Expected CompileFailed event last");
    }
}

/// Tests that events are broadcast to all connected clients.
#[tokio::test]
async fn test_events_broadcast_to_all_clients() {
    let state = test_state();
    let orchestrator = state.orchestrator.clone();
    let (ws_url, _handle) = spawn_test_server(state).await;

    let mut client1 = connect_client(&ws_url).await;
    let mut client2 = connect_client(&ws_url).await;
    receive_event(&mut client1).await;
    receive_event(&mut client2).await;

    submit(&orchestrator, TOGGLE);

    let event1 = receive_event(&mut client1).await;
    let event2 = receive_event(&mut client2).await;
    assert!(matches!(event1, GradingEvent::StateChanged(_)));
    assert_eq!(event1, event2);
}

// ============================================================================
// Disconnection Tests
// ============================================================================

/// Tests that client can cleanly disconnect.
#[tokio::test]
async fn test_client_can_disconnect() {
    let (ws_url, _handle) = spawn_test_server(test_state()).await;

    let mut client = connect_client(&ws_url).await;
    receive_event(&mut client).await; // Consume connected event

    client
        .close(None)
        .await
        .expect("Failed to close connection");
}

/// Tests that the server continues after a client disconnects.
#[tokio::test]
async fn test_server_continues_after_client_disconnect() {
    let state = test_state();
    let orchestrator = state.orchestrator.clone();
    let (ws_url, _handle) = spawn_test_server(state).await;

    // Connect and disconnect first client
    let mut client1 = connect_client(&ws_url).await;
    receive_event(&mut client1).await;
    client1.close(None).await.ok();
    drop(client1);

    // Give server time to process disconnect
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client2 = connect_client(&ws_url).await;
    assert!(matches!(receive_event(&mut client2).await, GradingEvent::Connected(_)));

    submit(&orchestrator, TOGGLE);
    assert!(matches!(receive_event(&mut client2).await, GradingEvent::StateChanged(_)));
}
