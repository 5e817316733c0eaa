//! The lesson grading state machine.
//!
//! [`LessonMachine`] is a pure reducer: it consumes a [`LessonEvent`],
//! updates its state and [`LessonContext`], and returns a [`Reaction`]
//! listing the transitions taken and the [`Effect`]s the driver must
//! perform. It never touches timers, the network or a machine instance.
//!
//! ```text
//! idle.* --edit--> throttling --quiet--> checkingCompile --ok--> runningTests
//!                                              |                  runningStep
//!                                              | failure          checkingForMoreSteps
//!                                              v                  complete
//!                                     idle.invalidCompile
//! ```
//!
//! An edit in any state re-enters `throttling`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cursor::{self, Cursor};
use crate::error::InvalidReason;
use crate::script::LessonScript;

// ============================================================================
// States
// ============================================================================

/// Settled outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdleState {
    /// Initial state, or the last run hit a failing assertion.
    NotPassed,
    /// The last run executed every step successfully.
    Passed,
    /// The last source did not compile or instantiate.
    InvalidCompile,
}

/// Sub-states of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    /// Executing the step at the cursor.
    RunningStep,
    /// Looking for the next position.
    CheckingForMoreSteps,
    /// Every step ran; the run is finishing.
    Complete,
}

/// Where the grading session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LessonState {
    /// Waiting for edits.
    Idle(IdleState),
    /// Quiet period after an edit.
    Throttling,
    /// Compile call in flight.
    CheckingCompile,
    /// Replaying the script against a live instance.
    RunningTests(RunPhase),
}

impl Default for LessonState {
    fn default() -> Self {
        Self::Idle(IdleState::NotPassed)
    }
}

impl LessonState {
    /// Dotted state path, as shown to clients.
    ///
    /// # Examples
    ///
    /// ```
    /// use lesson_orchestrator::{IdleState, LessonState, RunPhase};
    ///
    /// assert_eq!(LessonState::Idle(IdleState::NotPassed).path(), "idle.valid.notPassed");
    /// assert_eq!(LessonState::RunningTests(RunPhase::RunningStep).path(), "runningTests.runningStep");
    /// ```
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Idle(IdleState::NotPassed) => "idle.valid.notPassed",
            Self::Idle(IdleState::Passed) => "idle.valid.passed",
            Self::Idle(IdleState::InvalidCompile) => "idle.invalidCompile",
            Self::Throttling => "throttling",
            Self::CheckingCompile => "checkingCompile",
            Self::RunningTests(RunPhase::RunningStep) => "runningTests.runningStep",
            Self::RunningTests(RunPhase::CheckingForMoreSteps) => {
                "runningTests.checkingForMoreSteps"
            }
            Self::RunningTests(RunPhase::Complete) => "runningTests.complete",
        }
    }

    /// Returns `true` in any `idle` state.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Idle(_))
    }

    /// Returns `true` in any `runningTests` sub-state.
    #[must_use]
    pub const fn is_running_tests(&self) -> bool {
        matches!(self, Self::RunningTests(_))
    }
}

impl fmt::Display for LessonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl Serialize for LessonState {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.path())
    }
}

// ============================================================================
// Events, effects and context
// ============================================================================

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LessonEvent {
    /// The learner replaced the source text.
    TextEdited(String),
    /// The quiet period after the last edit elapsed.
    QuietPeriodElapsed,
    /// The gateway produced a running instance.
    CompileSucceeded,
    /// The gateway failed.
    CompileFailed(InvalidReason),
    /// The step at the cursor passed.
    StepSucceeded,
    /// The step at the cursor was an assertion that did not hold.
    StepFailed,
}

/// Work the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// (Re)arm the quiet-period timer.
    RestartQuietPeriod,
    /// Disarm the quiet-period timer.
    CancelQuietPeriod,
    /// Compile and instantiate this source.
    Compile(String),
    /// Abandon the compile in flight, if any.
    CancelCompile,
    /// Execute the step at this cursor.
    ExecuteStep(Cursor),
    /// Stop and drop the current instance.
    ReleaseInstance,
}

/// One state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State left.
    pub from: LessonState,
    /// State entered.
    pub to: LessonState,
}

/// Result of handling one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reaction {
    /// Effects in the order they must be performed.
    pub effects: Vec<Effect>,
    /// Transitions in the order they were taken.
    pub transitions: Vec<Transition>,
}

impl Reaction {
    /// Returns `true` if the event was ignored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.transitions.is_empty()
    }
}

/// Extended state carried across transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonContext {
    /// Latest learner source.
    pub source_text: String,
    /// Position of the step being run.
    pub cursor: Cursor,
    /// The step whose assertion failed in the last failing run.
    pub last_errored_step: Option<Cursor>,
    /// Why the last compile failed.
    pub invalid_reason: Option<InvalidReason>,
}

// ============================================================================
// LessonMachine
// ============================================================================

/// Pure grading state machine over a fixed script.
#[derive(Debug, Clone)]
pub struct LessonMachine {
    state: LessonState,
    context: LessonContext,
    script: Arc<LessonScript>,
}

impl LessonMachine {
    /// Creates a machine in `idle.valid.notPassed` with empty source.
    #[must_use]
    pub fn new(script: Arc<LessonScript>) -> Self {
        Self {
            state: LessonState::default(),
            context: LessonContext::default(),
            script,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LessonState {
        self.state
    }

    /// Current context.
    #[must_use]
    pub const fn context(&self) -> &LessonContext {
        &self.context
    }

    /// The script being graded.
    #[must_use]
    pub fn script(&self) -> &Arc<LessonScript> {
        &self.script
    }

    /// Applies `event`. Events that do not apply to the current state are
    /// ignored and yield an empty reaction.
    pub fn handle(&mut self, event: LessonEvent) -> Reaction {
        let mut reaction = Reaction::default();

        match (self.state, event) {
            (_, LessonEvent::TextEdited(text)) => {
                self.context.source_text = text;
                self.go(LessonState::Throttling, &mut reaction);
            }
            (LessonState::Throttling, LessonEvent::QuietPeriodElapsed) => {
                self.go(LessonState::CheckingCompile, &mut reaction);
            }
            (LessonState::CheckingCompile, LessonEvent::CompileSucceeded) => {
                self.go(LessonState::RunningTests(RunPhase::RunningStep), &mut reaction);
            }
            (LessonState::CheckingCompile, LessonEvent::CompileFailed(reason)) => {
                self.context.invalid_reason = Some(reason);
                self.go(LessonState::Idle(IdleState::InvalidCompile), &mut reaction);
            }
            (LessonState::RunningTests(RunPhase::RunningStep), LessonEvent::StepSucceeded) => {
                self.go(
                    LessonState::RunningTests(RunPhase::CheckingForMoreSteps),
                    &mut reaction,
                );
            }
            (LessonState::RunningTests(RunPhase::RunningStep), LessonEvent::StepFailed) => {
                self.context.last_errored_step = Some(self.context.cursor);
                self.go(LessonState::Idle(IdleState::NotPassed), &mut reaction);
            }
            _ => {}
        }

        reaction
    }

    fn go(&mut self, target: LessonState, reaction: &mut Reaction) {
        let from = self.state;

        // exit actions
        if from == LessonState::Throttling {
            reaction.effects.push(Effect::CancelQuietPeriod);
        }
        if from == LessonState::CheckingCompile {
            reaction.effects.push(Effect::CancelCompile);
        }
        if from.is_running_tests() && !target.is_running_tests() {
            reaction.effects.push(Effect::ReleaseInstance);
        }

        if target.is_running_tests() && !from.is_running_tests() {
            self.context.cursor = Cursor::START;
            self.context.last_errored_step = None;
        }

        self.state = target;
        reaction.transitions.push(Transition { from, to: target });

        // entry actions
        match target {
            LessonState::Throttling => reaction.effects.push(Effect::RestartQuietPeriod),
            LessonState::CheckingCompile => {
                self.context.invalid_reason = None;
                reaction
                    .effects
                    .push(Effect::Compile(self.context.source_text.clone()));
            }
            LessonState::RunningTests(RunPhase::RunningStep) => {
                reaction.effects.push(Effect::ExecuteStep(self.context.cursor));
            }
            LessonState::RunningTests(RunPhase::CheckingForMoreSteps) => {
                match cursor::next(&self.script, self.context.cursor) {
                    Some(next) => {
                        self.context.cursor = next;
                        self.go(LessonState::RunningTests(RunPhase::RunningStep), reaction);
                    }
                    None => self.go(LessonState::RunningTests(RunPhase::Complete), reaction),
                }
            }
            LessonState::RunningTests(RunPhase::Complete) => {
                self.go(LessonState::Idle(IdleState::Passed), reaction);
            }
            LessonState::Idle(_) => {}
        }
    }
}
