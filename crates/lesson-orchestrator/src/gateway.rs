//! Compilation gateway.
//!
//! Wraps the compiler service and the machine runtime into one async
//! operation: learner source in, running machine instance (or a
//! [`CompileFailure`]) out. Nothing here retries; recovery is a new edit.

use std::sync::Arc;

use async_trait::async_trait;
use lesson_machine::{InstanceLease, MachineRuntime};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::{CompilerBackend, CompilerConfig};
use crate::error::CompileFailure;

/// What a compiler service answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResponse {
    /// Whether the source compiled.
    pub did_it_work: bool,

    /// The compiled machine definition, present on success.
    #[serde(default)]
    pub result: Option<Value>,
}

impl CompileResponse {
    /// A successful compilation of `definition`.
    #[must_use]
    pub const fn compiled(definition: Value) -> Self {
        Self {
            did_it_work: true,
            result: Some(definition),
        }
    }

    /// A rejected compilation.
    #[must_use]
    pub const fn rejected() -> Self {
        Self {
            did_it_work: false,
            result: None,
        }
    }
}

/// Turns source text into a machine definition.
#[async_trait]
pub trait CompilerService: Send + Sync {
    /// Compiles `source`.
    ///
    /// # Errors
    ///
    /// Returns [`CompileFailure::Transport`] when the service cannot be
    /// reached and [`CompileFailure::MalformedResponse`] when its answer
    /// cannot be read. A source that does not compile is a successful call
    /// with `did_it_work: false`.
    async fn compile(&self, source: &str) -> Result<CompileResponse, CompileFailure>;
}

#[derive(Debug, Serialize)]
struct CompileRequest<'a> {
    file: &'a str,
}

/// Compiler service reached with `POST {url}` and a `{"file": ...}` body.
#[derive(Debug, Clone)]
pub struct HttpCompiler {
    url: String,
    http: Client,
}

impl HttpCompiler {
    /// Creates a client for the compile endpoint at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, Client::new())
    }

    /// Creates a client using a preconfigured `reqwest` client.
    #[must_use]
    pub fn with_client(url: impl Into<String>, http: Client) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }

    /// The compile endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CompilerService for HttpCompiler {
    async fn compile(&self, source: &str) -> Result<CompileResponse, CompileFailure> {
        let response = self
            .http
            .post(&self.url)
            .json(&CompileRequest { file: source })
            .send()
            .await
            .map_err(|e| CompileFailure::Transport(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CompileFailure::Transport(format!(
                "compiler answered {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CompileFailure::Transport(format!("failed to read response: {e}")))?;

        serde_json::from_str(&body)
            .map_err(|e| CompileFailure::MalformedResponse(format!("failed to parse response: {e}")))
    }
}

/// Offline compiler: the source text is itself a JSON machine definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCompiler;

impl JsonCompiler {
    /// Creates the compiler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CompilerService for JsonCompiler {
    async fn compile(&self, source: &str) -> Result<CompileResponse, CompileFailure> {
        match serde_json::from_str::<Value>(source) {
            Ok(definition) => Ok(CompileResponse::compiled(definition)),
            Err(e) => {
                debug!(error = %e, "Source is not valid JSON");
                Ok(CompileResponse::rejected())
            }
        }
    }
}

/// Builds the compiler service selected in configuration.
#[must_use]
pub fn compiler_from_config(config: &CompilerConfig) -> Arc<dyn CompilerService> {
    match config.backend {
        CompilerBackend::Http => Arc::new(HttpCompiler::new(config.url.clone())),
        CompilerBackend::Json => Arc::new(JsonCompiler::new()),
    }
}

/// Compiles source and instantiates the result.
#[derive(Clone)]
pub struct CompilationGateway {
    compiler: Arc<dyn CompilerService>,
    runtime: Arc<dyn MachineRuntime>,
}

impl CompilationGateway {
    /// Creates a gateway over a compiler service and a machine runtime.
    #[must_use]
    pub fn new(compiler: Arc<dyn CompilerService>, runtime: Arc<dyn MachineRuntime>) -> Self {
        Self { compiler, runtime }
    }

    /// Compiles `source`, instantiates the definition and starts it.
    ///
    /// Empty source fails with [`CompileFailure::EmptySource`] without
    /// calling the compiler service.
    ///
    /// # Errors
    ///
    /// Returns the [`CompileFailure`] describing the first stage that failed.
    #[instrument(skip(self, source), fields(source_len = source.len()))]
    pub async fn compile(&self, source: &str) -> Result<InstanceLease, CompileFailure> {
        if source.is_empty() {
            debug!("Empty source, skipping compiler");
            return Err(CompileFailure::EmptySource);
        }

        let response = self.compiler.compile(source).await?;
        if !response.did_it_work {
            info!("Compiler rejected the source");
            return Err(CompileFailure::Rejected);
        }

        let definition = match response.result {
            Some(Value::Null) | None => {
                warn!("Compiler reported success without a definition");
                return Err(CompileFailure::MalformedResponse(
                    "missing machine definition".to_string(),
                ));
            }
            Some(definition) => definition,
        };

        let mut instance = self.runtime.instantiate(&definition)?;
        instance.start()?;
        info!(state = %instance.current_state().value, "Machine instance started");
        Ok(InstanceLease::new(instance))
    }
}

impl std::fmt::Debug for CompilationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationGateway").finish_non_exhaustive()
    }
}
