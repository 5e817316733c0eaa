//! Configuration types for the Lesson Runner orchestrator.
//!
//! This module provides the configuration structures that control a grading
//! session: which lesson to load, how long edits are debounced, and which
//! compiler backend turns learner source into a machine definition.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraderError, Result};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "lesson-runner.json";

/// Default lesson file path.
fn default_lesson() -> String {
    "lesson.json".to_string()
}

/// Default quiet period after the last edit, in milliseconds.
const fn default_throttle_ms() -> u64 {
    700
}

/// Default compiler endpoint.
fn default_compiler_url() -> String {
    "http://127.0.0.1:3000/api/compile".to_string()
}

/// Default per-subscriber buffer for status events.
const fn default_event_buffer_size() -> usize {
    100
}

/// Main configuration for a grading session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Path to the lesson file holding the acceptance criteria.
    #[serde(default = "default_lesson")]
    pub lesson: String,

    /// Quiet period after the last edit before compiling, in milliseconds.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// Compiler backend settings.
    #[serde(default)]
    pub compiler: CompilerConfig,

    /// Buffer size for each status event subscriber.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lesson: default_lesson(),
            throttle_ms: default_throttle_ms(),
            compiler: CompilerConfig::default(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `lesson-runner.json` in the current directory. If found,
    /// loads and validates the configuration. If not found, returns default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            GraderError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `lesson-runner.json` in a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        Self::load_from_file(&config_path)
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `GraderError::ConfigParseError` if the file exists but contains
    /// invalid JSON or invalid enum values.
    ///
    /// Returns `GraderError::ConfigValidationError` if the configuration values
    /// are invalid (e.g., zero throttle, empty paths).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(GraderError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GraderError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// Checks that:
    /// - `lesson` path is not empty
    /// - `throttle_ms` is greater than 0
    /// - `event_buffer_size` is greater than 0
    /// - `compiler.url` is not empty when the HTTP backend is selected
    ///
    /// # Errors
    ///
    /// Returns `GraderError::ConfigValidationError` if any validation check fails.
    pub fn validate(&self) -> Result<()> {
        if self.lesson.trim().is_empty() {
            return Err(GraderError::config_validation(
                "lesson path must not be empty",
                "Provide a valid lesson file path in your lesson-runner.json",
            ));
        }

        if self.throttle_ms == 0 {
            return Err(GraderError::config_validation(
                "throttleMs must be greater than 0",
                "Set throttleMs to at least 1 millisecond in your lesson-runner.json (700 is the usual value)",
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(GraderError::config_validation(
                "eventBufferSize must be greater than 0",
                "Set eventBufferSize to at least 1 in your lesson-runner.json",
            ));
        }

        if self.compiler.backend == CompilerBackend::Http && self.compiler.url.trim().is_empty() {
            return Err(GraderError::config_validation(
                "compiler.url must not be empty for the http backend",
                "Set compiler.url to the compile endpoint, or use the json backend",
            ));
        }

        Ok(())
    }

    /// The quiet period as a [`Duration`].
    #[must_use]
    pub const fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

/// Compiler backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerConfig {
    /// Which backend compiles learner source.
    #[serde(default)]
    pub backend: CompilerBackend,

    /// Compile endpoint for the HTTP backend.
    #[serde(default = "default_compiler_url")]
    pub url: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            backend: CompilerBackend::default(),
            url: default_compiler_url(),
        }
    }
}

/// Supported compiler backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompilerBackend {
    /// Remote compile service reached over HTTP (default).
    #[default]
    Http,
    /// The source text is itself a JSON machine definition.
    Json,
}

impl CompilerBackend {
    /// Parses a string into a `CompilerBackend`, case-insensitively.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Self::Http),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for CompilerBackend {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid compiler backend '{s}': expected one of 'http', 'json'"
            ))
        })
    }
}

impl CompilerBackend {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for CompilerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CompilerBackend {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
