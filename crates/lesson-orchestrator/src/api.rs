//! HTTP API endpoints for the Lesson Runner orchestrator.
//!
//! This module provides the REST surface an editor front end uses to submit
//! learner source and read grading results, plus the `/ws` event stream.
//!
//! # Endpoints
//!
//! - `POST /api/edit` - Submit the learner's full source text
//! - `GET /api/status` - Get the current grading status
//! - `GET /api/lesson` - Get the lesson outline
//! - `GET /api/config` - Get the session configuration
//! - `GET /ws` - Subscribe to grading events
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lesson_machine::Interpreter;
//! use lesson_orchestrator::{
//!     create_router, AppState, CompilationGateway, Config, JsonCompiler, LessonOrchestrator,
//!     LessonScript, OrchestratorOptions,
//! };
//!
//! # async fn example() {
//! let config = Config::default();
//! let script = Arc::new(LessonScript::load(&config.lesson).unwrap());
//! let gateway = CompilationGateway::new(Arc::new(JsonCompiler::new()), Arc::new(Interpreter::new()));
//! let orchestrator = LessonOrchestrator::spawn(
//!     Arc::clone(&script),
//!     gateway,
//!     OrchestratorOptions::from(&config),
//! );
//!
//! let state = AppState::new(config, orchestrator, &script);
//! let router = create_router(state);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//! axum::serve(listener, router).await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::config::Config;
use crate::orchestrator::OrchestratorHandle;
use crate::script::{LessonOutline, LessonScript};
use crate::status::StatusSnapshot;
use crate::websocket::ws_handler;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for the edit endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EditRequest {
    /// The learner's full source text.
    pub text: String,
}

/// Response body for the edit endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditResponse {
    /// Whether the edit was queued.
    pub accepted: bool,
    /// Epoch assigned to the edit.
    pub epoch: u64,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Configuration for the session.
    pub config: Config,
    /// Handle to the grading orchestrator.
    pub orchestrator: OrchestratorHandle,
    /// Outline of the lesson being graded.
    pub lesson: LessonOutline,
}

impl AppState {
    /// Creates a new `AppState`.
    #[must_use]
    pub fn new(config: Config, orchestrator: OrchestratorHandle, script: &LessonScript) -> Self {
        Self {
            config,
            orchestrator,
            lesson: script.outline(),
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Internal error type for API handlers.
#[derive(Debug)]
enum ApiError {
    /// The orchestrator is no longer accepting edits.
    OrchestratorStopped(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::OrchestratorStopped(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all API endpoints.
///
/// The router has all API routes under `/api`, the event stream at `/ws`,
/// CORS middleware for development and tracing middleware for request
/// logging.
pub fn create_router(state: AppState) -> Router {
    // Allow all origins; the editor is served separately in development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/edit", post(handle_edit))
        .route("/status", get(handle_status))
        .route("/lesson", get(handle_lesson))
        .route("/config", get(handle_config));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `POST /api/edit`.
async fn handle_edit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EditRequest>,
) -> Result<(StatusCode, Json<EditResponse>), ApiError> {
    let len = request.text.len();
    let epoch = state.orchestrator.text_edited(request.text).map_err(|e| {
        warn!(error = %e, "Rejected edit");
        ApiError::OrchestratorStopped("Lesson orchestrator has stopped".to_string())
    })?;

    debug!(epoch, len, "Edit accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(EditResponse {
            accepted: true,
            epoch,
        }),
    ))
}

/// Handler for `GET /api/status`.
async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.orchestrator.status())
}

/// Handler for `GET /api/lesson`.
async fn handle_lesson(State(state): State<Arc<AppState>>) -> Json<LessonOutline> {
    Json(state.lesson.clone())
}

/// Handler for `GET /api/config`.
async fn handle_config(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json(state.config.clone())
}

// ============================================================================
// Tests
// ============================================================================
