//! Async driver for the grading state machine.
//!
//! [`LessonOrchestrator`] is a single tokio task that owns the
//! [`LessonMachine`], the quiet-period timer and the live machine instance.
//! It consumes one message at a time (learner commands first, then
//! completions of its own async work, then the timer) and performs the
//! effects each transition asks for. Callers talk to it through an [`OrchestratorHandle`].
//!
//! Every edit bumps the epoch. Compile and step completions carry the epoch
//! that launched them and are dropped when it is no longer current. Leaving
//! `checkingCompile` aborts the compile task, and a stale instance is stopped
//! as soon as its lease is dropped.

use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lesson_machine::InstanceLease;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cursor::Cursor;
use crate::error::{AssertionFailure, CompileFailure, GraderError, Result};
use crate::executor;
use crate::gateway::CompilationGateway;
use crate::machine::{
    Effect, IdleState, LessonEvent, LessonMachine, LessonState, RunPhase, Transition,
};
use crate::script::LessonScript;
use crate::status::{LessonStatus, StatusSnapshot};
use crate::websocket::{EventBroadcaster, GradingEvent};

/// Tuning for a [`LessonOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Quiet period after the last edit before compiling.
    pub throttle: Duration,
    /// Per-subscriber event buffer.
    pub event_capacity: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(700),
            event_capacity: 100,
        }
    }
}

impl From<&Config> for OrchestratorOptions {
    fn from(config: &Config) -> Self {
        Self {
            throttle: config.throttle(),
            event_capacity: config.event_buffer_size,
        }
    }
}

enum Command {
    TextEdited { text: String, epoch: u64 },
    Shutdown { done: oneshot::Sender<()> },
}

enum Completion {
    Compiled {
        epoch: u64,
        outcome: std::result::Result<InstanceLease, CompileFailure>,
    },
    StepFinished {
        epoch: u64,
        cursor: Cursor,
        outcome: std::result::Result<(), AssertionFailure>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StatusSnapshot>,
    events: EventBroadcaster,
    last_epoch: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextEdited { epoch, .. } => write!(f, "TextEdited({epoch})"),
            Self::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

impl OrchestratorHandle {
    /// Submits the learner's full source text.
    ///
    /// Returns the epoch assigned to this edit.
    ///
    /// # Errors
    ///
    /// Returns `GraderError::OrchestratorStopped` if the orchestrator has shut down.
    pub fn text_edited(&self, text: impl Into<String>) -> Result<u64> {
        let mut last_epoch = self
            .last_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let epoch = *last_epoch + 1;
        self.commands
            .send(Command::TextEdited {
                text: text.into(),
                epoch,
            })
            .map_err(|_| GraderError::OrchestratorStopped)?;
        *last_epoch = epoch;
        Ok(epoch)
    }

    /// Epoch of the most recent accepted edit.
    #[must_use]
    pub fn last_epoch(&self) -> u64 {
        *self
            .last_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Subscribes to grading events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GradingEvent> {
        self.events.subscribe()
    }

    /// Waits until every edit accepted so far has been processed to a
    /// settled (`idle`) state, and returns that status.
    ///
    /// # Errors
    ///
    /// Returns `GraderError::OrchestratorStopped` if the orchestrator stops
    /// before settling.
    pub async fn settled(&self) -> Result<StatusSnapshot> {
        let target = self.last_epoch();
        let mut status = self.status.clone();
        let snapshot = status
            .wait_for(|snapshot| snapshot.is_settled_at(target))
            .await
            .map_err(|_| GraderError::OrchestratorStopped)?;
        Ok(snapshot.clone())
    }

    /// Stops the orchestrator, releasing any live instance.
    ///
    /// # Errors
    ///
    /// Returns `GraderError::OrchestratorStopped` if it had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, stopped) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { done })
            .map_err(|_| GraderError::OrchestratorStopped)?;
        stopped.await.map_err(|_| GraderError::OrchestratorStopped)
    }

    /// Returns `true` while the orchestrator task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

// ============================================================================
// Orchestrator task
// ============================================================================

/// The grading actor. Create one with [`LessonOrchestrator::spawn`].
pub struct LessonOrchestrator {
    machine: LessonMachine,
    gateway: CompilationGateway,
    throttle: Duration,
    epoch: u64,
    instance: Option<InstanceLease>,
    quiet_period: Option<Pin<Box<Sleep>>>,
    compile_task: Option<JoinHandle<()>>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    status: watch::Sender<StatusSnapshot>,
    events: EventBroadcaster,
}

impl LessonOrchestrator {
    /// Starts an orchestrator for `script` on the current tokio runtime.
    #[must_use]
    pub fn spawn(
        script: Arc<LessonScript>,
        gateway: CompilationGateway,
        options: OrchestratorOptions,
    ) -> OrchestratorHandle {
        let machine = LessonMachine::new(script);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::capture(&machine, 0));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let events = EventBroadcaster::new(options.event_capacity);

        let orchestrator = Self {
            machine,
            gateway,
            throttle: options.throttle,
            epoch: 0,
            instance: None,
            quiet_period: None,
            compile_task: None,
            commands: commands_rx,
            completions_tx,
            completions_rx,
            status: status_tx,
            events: events.clone(),
        };
        tokio::spawn(orchestrator.run());

        info!(throttle = ?options.throttle, "Lesson orchestrator started");

        OrchestratorHandle {
            commands: commands_tx,
            status: status_rx,
            events,
            last_epoch: Arc::new(Mutex::new(0)),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::TextEdited { text, epoch }) => {
                        self.epoch = epoch;
                        debug!(epoch, len = text.len(), "Text edited");
                        self.dispatch(LessonEvent::TextEdited(text));
                    }
                    Some(Command::Shutdown { done }) => {
                        // Refuse edits before acknowledging
                        self.commands.close();
                        self.release_all();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.release_all();
                        break;
                    }
                },

                Some(completion) = self.completions_rx.recv() => {
                    self.complete(completion);
                }

                () = quiet_period_elapsed(&mut self.quiet_period) => {
                    self.quiet_period = None;
                    self.dispatch(LessonEvent::QuietPeriodElapsed);
                }
            }
        }

        info!(epoch = self.epoch, "Lesson orchestrator stopped");
    }

    fn dispatch(&mut self, event: LessonEvent) {
        let reaction = self.machine.handle(event);
        if reaction.is_empty() {
            debug!(state = %self.machine.state(), "Event ignored");
            return;
        }

        for transition in &reaction.transitions {
            self.announce(*transition);
        }
        for effect in reaction.effects {
            self.perform(effect);
        }
        self.status
            .send_replace(StatusSnapshot::capture(&self.machine, self.epoch));
    }

    fn announce(&self, transition: Transition) {
        debug!(from = %transition.from, to = %transition.to, epoch = self.epoch, "State changed");
        self.events.send(GradingEvent::state_changed(
            transition.from.path(),
            transition.to.path(),
            self.epoch,
        ));

        if transition.from.is_running_tests() && transition.to.is_settled() {
            let status = LessonStatus::from(transition.to);
            let last_errored_step = if transition.to == LessonState::Idle(IdleState::NotPassed) {
                self.machine.context().last_errored_step
            } else {
                None
            };
            info!(%status, epoch = self.epoch, ?last_errored_step, "Test run complete");
            self.events.send(GradingEvent::run_complete(
                status,
                last_errored_step,
                self.epoch,
            ));
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::RestartQuietPeriod => {
                self.quiet_period = Some(Box::pin(sleep(self.throttle)));
            }
            Effect::CancelQuietPeriod => {
                self.quiet_period = None;
            }
            Effect::Compile(source) => {
                let gateway = self.gateway.clone();
                let completions = self.completions_tx.clone();
                let epoch = self.epoch;
                let task = tokio::spawn(async move {
                    let outcome = gateway.compile(&source).await;
                    // A closed channel drops the outcome, stopping any instance
                    let _ = completions.send(Completion::Compiled { epoch, outcome });
                });
                if let Some(previous) = self.compile_task.replace(task) {
                    previous.abort();
                }
            }
            Effect::CancelCompile => self.cancel_compile(),
            Effect::ExecuteStep(cursor) => self.execute_step(cursor),
            Effect::ReleaseInstance => {
                if let Some(lease) = self.instance.take() {
                    lease.release();
                    debug!(epoch = self.epoch, "Released machine instance");
                }
            }
        }
    }

    fn execute_step(&mut self, cursor: Cursor) {
        let script = Arc::clone(self.machine.script());
        let outcome = executor::execute_at(
            &script,
            cursor,
            self.instance.as_mut().map(InstanceLease::instance_mut),
        );

        let label = script
            .step_at(cursor)
            .map_or_else(|| "(no step)".to_string(), |step| step.label());
        match &outcome {
            Ok(()) => debug!(%cursor, %label, "Step passed"),
            Err(failure) => info!(%cursor, %failure, "Step failed"),
        }
        self.events.send(GradingEvent::step_executed(
            cursor,
            label,
            outcome.is_ok(),
            self.epoch,
        ));

        // Posted rather than dispatched so pending edits are handled first
        let _ = self.completions_tx.send(Completion::StepFinished {
            epoch: self.epoch,
            cursor,
            outcome,
        });
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Compiled { epoch, outcome } => {
                if epoch != self.epoch || self.machine.state() != LessonState::CheckingCompile {
                    debug!(epoch, current = self.epoch, "Discarding stale compile result");
                    return;
                }
                match outcome {
                    Ok(lease) => {
                        if let Some(previous) = self.instance.replace(lease) {
                            warn!("Replacing a machine instance that was still held");
                            previous.release();
                        }
                        self.dispatch(LessonEvent::CompileSucceeded);
                    }
                    Err(failure) => {
                        let reason = failure.reason();
                        info!(%failure, epoch, "Compilation failed");
                        self.events.send(GradingEvent::compile_failed(
                            reason,
                            failure.to_string(),
                            epoch,
                        ));
                        self.dispatch(LessonEvent::CompileFailed(reason));
                    }
                }
            }
            Completion::StepFinished {
                epoch,
                cursor,
                outcome,
            } => {
                let current = self.machine.state()
                    == LessonState::RunningTests(RunPhase::RunningStep)
                    && self.machine.context().cursor == cursor;
                if epoch != self.epoch || !current {
                    debug!(epoch, %cursor, "Discarding stale step result");
                    return;
                }
                self.dispatch(match outcome {
                    Ok(()) => LessonEvent::StepSucceeded,
                    Err(_) => LessonEvent::StepFailed,
                });
            }
        }
    }

    fn cancel_compile(&mut self) {
        if let Some(task) = self.compile_task.take() {
            if !task.is_finished() {
                debug!(epoch = self.epoch, "Aborting compile in flight");
            }
            task.abort();
        }
    }

    fn release_all(&mut self) {
        self.quiet_period = None;
        self.cancel_compile();
        if let Some(lease) = self.instance.take() {
            lease.release();
            info!("Released machine instance on shutdown");
        }
    }
}

async fn quiet_period_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
