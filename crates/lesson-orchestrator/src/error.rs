//! Error types for the Lesson Runner orchestrator.
//!
//! This module defines the host-level error hierarchy (configuration, lesson
//! loading, orchestrator lifecycle) and the two grading failures that the
//! orchestrator turns into state transitions: [`CompileFailure`] and
//! [`AssertionFailure`].

use std::path::PathBuf;

use lesson_machine::{MachineError, MachineSnapshot};
use serde::{Deserialize, Serialize};

/// A specialized `Result` type for orchestrator operations.
pub type Result<T> = std::result::Result<T, GraderError>;

/// Errors that can occur while hosting a grading session.
///
/// Error variants are organized by subsystem and include actionable suggestions
/// where possible to help users resolve issues.
#[derive(Debug, thiserror::Error)]
pub enum GraderError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your lesson-runner.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Lesson Loading Errors
    // ========================================================================
    /// Lesson file was not found at the specified path.
    #[error("Lesson not found: '{path}'\n\nSuggestion: Check the 'lesson' field in lesson-runner.json or pass --lesson")]
    LessonNotFound {
        /// Path where the lesson was expected.
        path: PathBuf,
    },

    /// Lesson file exceeds the 1MB size limit.
    #[error("Lesson exceeds size limit (1024KB): '{path}' is {size_kb}KB\n\nSuggestion: Split the acceptance criteria into smaller lessons")]
    LessonTooLarge {
        /// Path to the oversized lesson.
        path: PathBuf,
        /// Actual size in kilobytes.
        size_kb: u64,
    },

    /// Lesson file contains non-UTF-8 content.
    #[error("Lesson has invalid encoding: '{path}'\n\nSuggestion: Convert the file to UTF-8 encoding")]
    LessonEncodingError {
        /// Path to the lesson with encoding issues.
        path: PathBuf,
    },

    /// Lesson file is not a valid lesson document.
    #[error("Invalid lesson '{path}': {message}\n\nSuggestion: Check the acceptanceCriteria cases and step types (ASSERTION, SEND_EVENT)")]
    LessonParseError {
        /// Path to the malformed lesson.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    // ========================================================================
    // Orchestrator Lifecycle Errors
    // ========================================================================
    /// The orchestrator task is no longer running.
    #[error("Lesson orchestrator has stopped\n\nSuggestion: Restart the grading session")]
    OrchestratorStopped,

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraderError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `LessonNotFound` error.
    #[must_use]
    pub fn lesson_not_found(path: impl Into<PathBuf>) -> Self {
        Self::LessonNotFound { path: path.into() }
    }

    /// Creates a new `LessonTooLarge` error.
    #[must_use]
    pub fn lesson_too_large(path: impl Into<PathBuf>, size_kb: u64) -> Self {
        Self::LessonTooLarge {
            path: path.into(),
            size_kb,
        }
    }

    /// Creates a new `LessonEncodingError`.
    #[must_use]
    pub fn lesson_encoding(path: impl Into<PathBuf>) -> Self {
        Self::LessonEncodingError { path: path.into() }
    }

    /// Creates a new `LessonParseError`.
    #[must_use]
    pub fn lesson_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::LessonParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error prevents a grading session from starting.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError { .. }
                | Self::ConfigValidationError { .. }
                | Self::LessonNotFound { .. }
                | Self::LessonTooLarge { .. }
                | Self::LessonEncodingError { .. }
                | Self::LessonParseError { .. }
        )
    }
}

/// Why a compile-and-instantiate attempt produced no running instance.
///
/// Every variant surfaces the same way (`idle.invalidCompile`); the detail is
/// only logged.
#[derive(Debug, thiserror::Error)]
pub enum CompileFailure {
    /// No source text was submitted; the compiler was never called.
    #[error("no source text to compile")]
    EmptySource,

    /// The compiler service could not be reached or answered with an error status.
    #[error("compiler transport failed: {0}")]
    Transport(String),

    /// The compiler reported that the source did not compile.
    #[error("compiler rejected the source")]
    Rejected,

    /// The compiler answered success without a usable machine definition.
    #[error("compiler returned an unusable result: {0}")]
    MalformedResponse(String),

    /// The runtime refused the machine definition.
    #[error("could not instantiate machine: {0}")]
    Instantiate(#[from] MachineError),
}

impl CompileFailure {
    /// Coarse reason exposed on the status surface.
    #[must_use]
    pub const fn reason(&self) -> InvalidReason {
        match self {
            Self::EmptySource => InvalidReason::EmptySource,
            Self::Transport(_)
            | Self::Rejected
            | Self::MalformedResponse(_)
            | Self::Instantiate(_) => InvalidReason::CompileFailed,
        }
    }
}

/// What the UI is told about an `invalidCompile` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// Nothing was submitted.
    EmptySource,
    /// The source could not be compiled or instantiated.
    CompileFailed,
}

/// An assertion step whose predicate returned `false`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("assertion failed: {description} (machine was in '{}')", .observed.value)]
pub struct AssertionFailure {
    /// Human-readable description of the assertion.
    pub description: String,
    /// The state the machine was in when the assertion was evaluated.
    pub observed: MachineSnapshot,
}
