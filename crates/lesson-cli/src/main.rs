//! Lesson Runner CLI
//!
//! Main entry point for grading learner-written state machines against a
//! lesson's acceptance criteria.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use lesson_machine::Interpreter;
use lesson_orchestrator::websocket::CompileFailedPayload;
use lesson_orchestrator::{
    compiler_from_config, create_router, AppState, CompilationGateway, CompilerBackend, Config,
    GraderError, GradingEvent, InvalidReason, LessonOrchestrator, LessonScript, LessonStatus,
    OrchestratorHandle, OrchestratorOptions, StatusSnapshot,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Default port for the HTTP API server.
const DEFAULT_PORT: u16 = 8080;

/// Lesson Runner - State Machine Lesson Grader
///
/// Compiles a learner's state machine, replays the lesson's acceptance
/// criteria against it and reports which step first failed.
#[derive(Parser, Debug)]
#[command(name = "lesson-runner")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the grading API and event stream until Ctrl+C
    Serve {
        #[command(flatten)]
        session: SessionArgs,

        /// Port for the HTTP API server
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },

    /// Grade a single source file and exit (0 when passed, 1 otherwise, 2 on bad setup)
    Check {
        /// Path to the learner's source file
        #[arg(value_name = "SOURCE")]
        source: PathBuf,

        #[command(flatten)]
        session: SessionArgs,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Options shared by every subcommand.
#[derive(Args, Debug)]
struct SessionArgs {
    /// Path to the lesson file
    #[arg(short, long, value_name = "FILE")]
    lesson: Option<String>,

    /// Path to configuration file (default: lesson-runner.json in current directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Compile endpoint for the http backend
    #[arg(long, value_name = "URL")]
    compiler_url: Option<String>,

    /// Compiler backend (http or json)
    #[arg(long, value_name = "BACKEND", value_parser = parse_backend)]
    backend: Option<CompilerBackend>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_backend(s: &str) -> Result<CompilerBackend, String> {
    CompilerBackend::from_str_case_insensitive(s)
        .ok_or_else(|| format!("invalid backend '{s}': expected 'http' or 'json'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Command::Serve { session, .. } | Command::Check { session, .. } => session.verbose,
    };

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Command::Serve { session, port } => serve(&session, port).await,
        Command::Check {
            source,
            session,
            json,
        } => check(&source, &session, json).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(failure_code(&e))
        }
    }
}

/// Exit status for an error: 2 when the session could not be set up, else 1.
fn failure_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<GraderError>() {
        Some(e) if e.is_fatal() => 2,
        _ => 1,
    }
}

/// Runs the orchestrator behind the HTTP API until Ctrl+C.
async fn serve(args: &SessionArgs, port: u16) -> anyhow::Result<ExitCode> {
    let config = resolve_config(args)?;
    print_config(&config);

    let (script, orchestrator) = start_session(&config)?;

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    let router = create_router(AppState::new(config, orchestrator.clone(), &script));

    println!();
    println!("HTTP API server running on http://{addr}");
    println!("Press Ctrl+C to stop");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await;

    println!();
    println!("Shutting down...");
    if let Err(e) = orchestrator.shutdown().await {
        tracing::warn!(error = %e, "Orchestrator already stopped");
    }

    served.map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))?;
    Ok(ExitCode::SUCCESS)
}

/// Grades one source file and reports the settled outcome.
async fn check(source: &Path, args: &SessionArgs, json: bool) -> anyhow::Result<ExitCode> {
    let config = resolve_config(args)?;

    let text = std::fs::read_to_string(source).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read source file '{}': {e}\n\nSuggestion: Check the path and that the file is UTF-8",
            source.display()
        )
    })?;

    let (script, orchestrator) = start_session(&config)?;
    let mut events = orchestrator.subscribe();

    orchestrator.text_edited(text)?;
    let snapshot = orchestrator.settled().await?;
    orchestrator.shutdown().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_outcome(&snapshot, &script, last_compile_failure(&mut events).as_ref());
    }

    Ok(if snapshot.status == LessonStatus::Passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Loads configuration and applies CLI overrides.
fn resolve_config(args: &SessionArgs) -> anyhow::Result<Config> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(ref lesson) = args.lesson {
        config.lesson.clone_from(lesson);
    }
    if let Some(ref url) = args.compiler_url {
        config.compiler.url.clone_from(url);
    }
    if let Some(backend) = args.backend {
        config.compiler.backend = backend;
    }

    // Re-validate after overrides
    config.validate()?;
    Ok(config)
}

fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                return Err(GraderError::config_validation(
                    format!("config file not found: '{}'", path.display()),
                    "Check the path or remove the --config flag to use defaults",
                )
                .into());
            }
            Ok(Config::load_from_file(path)?)
        }
        None => Ok(Config::load()?),
    }
}

/// Loads the lesson and spawns an orchestrator for it.
fn start_session(config: &Config) -> anyhow::Result<(Arc<LessonScript>, OrchestratorHandle)> {
    tracing::info!(lesson = %config.lesson, "Loading lesson");
    let script = Arc::new(LessonScript::load(&config.lesson)?);
    tracing::debug!(
        title = %script.title,
        steps = script.total_steps(),
        "Lesson loaded"
    );

    let gateway = CompilationGateway::new(
        compiler_from_config(&config.compiler),
        Arc::new(Interpreter::new()),
    );
    let orchestrator =
        LessonOrchestrator::spawn(Arc::clone(&script), gateway, OrchestratorOptions::from(config));

    Ok((script, orchestrator))
}

/// Returns the most recent `compile_failed` payload still buffered.
fn last_compile_failure(
    events: &mut broadcast::Receiver<GradingEvent>,
) -> Option<CompileFailedPayload> {
    let mut last = None;
    loop {
        match events.try_recv() {
            Ok(GradingEvent::CompileFailed(payload)) => last = Some(payload),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return last,
        }
    }
}

fn print_config(config: &Config) {
    println!("Configuration loaded:");
    println!("  Lesson: {}", config.lesson);
    println!("  Throttle: {}ms", config.throttle_ms);
    println!("  Compiler backend: {}", config.compiler.backend);
    if config.compiler.backend == CompilerBackend::Http {
        println!("  Compiler URL: {}", config.compiler.url);
    }
}

fn print_outcome(
    snapshot: &StatusSnapshot,
    script: &LessonScript,
    failure: Option<&CompileFailedPayload>,
) {
    match snapshot.status {
        LessonStatus::Passed => {
            println!("PASSED: all {} steps of '{}'", script.total_steps(), script.title);
        }
        LessonStatus::NotPassed => match snapshot.last_errored_step {
            Some(cursor) => {
                let label = script
                    .step_at(cursor)
                    .map_or_else(|| "unknown step".to_string(), |step| step.label());
                println!("NOT PASSED: failed at {cursor}: {label}");
            }
            None => println!("NOT PASSED"),
        },
        LessonStatus::InvalidCompile => {
            match snapshot.invalid_reason {
                Some(InvalidReason::EmptySource) => println!("INVALID: source is empty"),
                _ => println!("INVALID: source did not compile"),
            }
            if let Some(failure) = failure {
                println!("  {}", failure.message);
            }
        }
        LessonStatus::Busy => println!("BUSY"),
    }
}
