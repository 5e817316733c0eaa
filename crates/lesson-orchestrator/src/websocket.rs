//! WebSocket event types and broadcasting for real-time grading observation.
//!
//! Events are broadcast to every connected client as the orchestrator moves
//! through its states. Nothing is replayed to late subscribers; a new client
//! gets the current status in its `connected` event instead.
//!
//! # Event Types
//!
//! - `connected` - Sent when a client connects, includes current status
//! - `state_changed` - The orchestrator took a transition
//! - `step_executed` - A script step ran
//! - `run_complete` - A test run ended (passed or not)
//! - `compile_failed` - The source did not compile or instantiate
//!
//! # Example
//!
//! ```no_run
//! use lesson_orchestrator::websocket::{EventBroadcaster, GradingEvent};
//! use lesson_orchestrator::{LessonStatus, Cursor};
//!
//! # async fn example() {
//! let broadcaster = EventBroadcaster::new(100);
//! let mut receiver = broadcaster.subscribe();
//!
//! broadcaster.send(GradingEvent::step_executed(Cursor::START, "starts off", true, 1));
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::cursor::Cursor;
use crate::error::InvalidReason;
use crate::status::{LessonStatus, StatusSnapshot};

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// Status at the moment the client connected.
    pub status: StatusSnapshot,
}

/// Payload for the `state_changed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangedPayload {
    /// State path left.
    pub from: String,
    /// State path entered.
    pub to: String,
    /// Edit epoch the transition belongs to.
    pub epoch: u64,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

/// Payload for the `step_executed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecutedPayload {
    /// Position of the step.
    pub cursor: Cursor,
    /// Step label.
    pub label: String,
    /// Whether the step succeeded.
    pub passed: bool,
    /// Edit epoch of the run.
    pub epoch: u64,
}

/// Payload for the `run_complete` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCompletePayload {
    /// Outcome of the run.
    pub status: LessonStatus,
    /// The failing step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_errored_step: Option<Cursor>,
    /// Edit epoch of the run.
    pub epoch: u64,
}

/// Payload for the `compile_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFailedPayload {
    /// Coarse reason.
    pub reason: InvalidReason,
    /// Human-readable detail.
    pub message: String,
    /// Edit epoch of the compile.
    pub epoch: u64,
}

// ============================================================================
// Event Enum
// ============================================================================

/// WebSocket event types for grading observation.
///
/// All events are serialized as JSON objects with "event" and "payload" fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum GradingEvent {
    /// Sent when a client connects.
    Connected(ConnectedPayload),
    /// Sent on every transition.
    StateChanged(StateChangedPayload),
    /// Sent after each executed step.
    StepExecuted(StepExecutedPayload),
    /// Sent when a run ends.
    RunComplete(RunCompletePayload),
    /// Sent when compilation fails.
    CompileFailed(CompileFailedPayload),
}

impl GradingEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub const fn connected(status: StatusSnapshot) -> Self {
        Self::Connected(ConnectedPayload { status })
    }

    /// Creates a `StateChanged` event stamped now.
    #[must_use]
    pub fn state_changed(from: impl Into<String>, to: impl Into<String>, epoch: u64) -> Self {
        Self::StateChanged(StateChangedPayload {
            from: from.into(),
            to: to.into(),
            epoch,
            timestamp: Utc::now(),
        })
    }

    /// Creates a `StepExecuted` event.
    #[must_use]
    pub fn step_executed(cursor: Cursor, label: impl Into<String>, passed: bool, epoch: u64) -> Self {
        Self::StepExecuted(StepExecutedPayload {
            cursor,
            label: label.into(),
            passed,
            epoch,
        })
    }

    /// Creates a `RunComplete` event.
    #[must_use]
    pub const fn run_complete(
        status: LessonStatus,
        last_errored_step: Option<Cursor>,
        epoch: u64,
    ) -> Self {
        Self::RunComplete(RunCompletePayload {
            status,
            last_errored_step,
            epoch,
        })
    }

    /// Creates a `CompileFailed` event.
    #[must_use]
    pub fn compile_failed(reason: InvalidReason, message: impl Into<String>, epoch: u64) -> Self {
        Self::CompileFailed(CompileFailedPayload {
            reason,
            message: message.into(),
            epoch,
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::StateChanged(_) => "state_changed",
            Self::StepExecuted(_) => "step_executed",
            Self::RunComplete(_) => "run_complete",
            Self::CompileFailed(_) => "compile_failed",
        }
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Broadcasts grading events to all subscribers.
///
/// Uses a tokio broadcast channel for pub-sub event distribution.
/// Events are not persisted for disconnected clients.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<GradingEvent>,
}

impl EventBroadcaster {
    /// Creates a new `EventBroadcaster` with the specified buffer capacity.
    ///
    /// The buffer determines how many events can be queued per subscriber
    /// before old events are dropped.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber for receiving events.
    ///
    /// Each subscriber maintains its own buffer. If a subscriber falls behind,
    /// it will receive a `Lagged` error and miss some events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GradingEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event to all connected subscribers.
    ///
    /// Returns the number of active receivers that will receive the event.
    pub fn send(&self, event: GradingEvent) -> usize {
        // Err only means there are no receivers
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

/// Interval between heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("New WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handles a single WebSocket connection.
///
/// - Sends `connected` with the current status immediately
/// - Forwards all broadcast events to the client
/// - Sends heartbeat pings every 30 seconds
/// - Closes connection after 3 missed pongs
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the status so no transition falls in between
    let mut event_receiver = state.orchestrator.subscribe();

    let connected_event = GradingEvent::connected(state.orchestrator.status());
    let connected_json = match serde_json::to_string(&connected_event) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize connected event: {}", e);
            return;
        }
    };

    if sender.send(Message::Text(connected_json)).await.is_err() {
        debug!("Client disconnected before receiving connected event");
        return;
    }

    info!("WebSocket client connected, sent current status");

    let mut heartbeat_interval =
        interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut missed_pongs = 0u8;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                        debug!("Received pong from client");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested close");
                        break;
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("Ignoring data message from client");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            debug!("Failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }

            event = event_receiver.recv() => {
                match event {
                    Ok(grading_event) => {
                        let json = match serde_json::to_string(&grading_event) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!("Failed to serialize event: {}", e);
                                continue;
                            }
                        };

                        if sender.send(Message::Text(json)).await.is_err() {
                            debug!("Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Orchestrator stopped, closing connection");
                        break;
                    }
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    debug!("Failed to send ping, client disconnected");
                    break;
                }
                missed_pongs += 1;
                if missed_pongs >= MAX_MISSED_PONGS {
                    info!("Client missed {} pongs, closing connection", MAX_MISSED_PONGS);
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

// ============================================================================
// Tests
// ============================================================================
