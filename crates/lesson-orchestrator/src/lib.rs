//! Lesson Runner Orchestrator
//!
//! Grades learner-written state machines: debounces edits, compiles and
//! instantiates the source, replays the lesson's acceptance criteria against
//! the live instance and reports which step first failed. Also serves the
//! HTTP API and WebSocket event stream.

pub mod api;
pub mod config;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod machine;
pub mod orchestrator;
pub mod script;
pub mod status;
pub mod websocket;

pub use api::{create_router, AppState, EditRequest, EditResponse, ErrorResponse};
pub use config::{CompilerBackend, CompilerConfig, Config};
pub use cursor::{Cursor, Positions};
pub use error::{AssertionFailure, CompileFailure, GraderError, InvalidReason, Result};
pub use gateway::{
    compiler_from_config, CompilationGateway, CompileResponse, CompilerService, HttpCompiler,
    JsonCompiler,
};
pub use machine::{
    Effect, IdleState, LessonContext, LessonEvent, LessonMachine, LessonState, Reaction, RunPhase,
    Transition,
};
pub use orchestrator::{LessonOrchestrator, OrchestratorHandle, OrchestratorOptions};
pub use script::{
    Assertion, Case, Expectation, LessonOutline, LessonScript, Predicate, Step, StepKind,
    MAX_LESSON_SIZE,
};
pub use status::{LessonStatus, StatusSnapshot};
pub use websocket::{EventBroadcaster, GradingEvent};
