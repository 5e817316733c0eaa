//! Status surface published to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::InvalidReason;
use crate::machine::{IdleState, LessonMachine, LessonState};

/// Coarse grading outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    /// No passing run yet, or the last run failed an assertion.
    #[default]
    NotPassed,
    /// The last run passed every step.
    Passed,
    /// The last source did not compile.
    InvalidCompile,
    /// Throttling, compiling or running.
    Busy,
}

impl LessonStatus {
    /// Returns `true` for every status except `Busy`.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Busy)
    }
}

impl From<LessonState> for LessonStatus {
    fn from(state: LessonState) -> Self {
        match state {
            LessonState::Idle(IdleState::NotPassed) => Self::NotPassed,
            LessonState::Idle(IdleState::Passed) => Self::Passed,
            LessonState::Idle(IdleState::InvalidCompile) => Self::InvalidCompile,
            LessonState::Throttling
            | LessonState::CheckingCompile
            | LessonState::RunningTests(_) => Self::Busy,
        }
    }
}

impl std::fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPassed => write!(f, "not_passed"),
            Self::Passed => write!(f, "passed"),
            Self::InvalidCompile => write!(f, "invalid_compile"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

/// Point-in-time view of a grading session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Coarse outcome.
    pub status: LessonStatus,

    /// Full state path, e.g. `runningTests.runningStep`.
    pub state: String,

    /// The failing step, when `status` is `not_passed` after a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_errored_step: Option<Cursor>,

    /// Why compilation failed, when `status` is `invalid_compile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<InvalidReason>,

    /// Number of edits accepted so far.
    pub epoch: u64,

    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Captures the machine's current status.
    ///
    /// `last_errored_step` and `invalid_reason` are only reported in the
    /// settled state they explain.
    #[must_use]
    pub fn capture(machine: &LessonMachine, epoch: u64) -> Self {
        let state = machine.state();
        let status = LessonStatus::from(state);
        let context = machine.context();

        Self {
            status,
            state: state.path().to_string(),
            last_errored_step: if status == LessonStatus::NotPassed {
                context.last_errored_step
            } else {
                None
            },
            invalid_reason: if status == LessonStatus::InvalidCompile {
                context.invalid_reason
            } else {
                None
            },
            epoch,
            updated_at: Utc::now(),
        }
    }

    /// Returns `true` once the session has settled after edit `epoch`.
    #[must_use]
    pub const fn is_settled_at(&self, epoch: u64) -> bool {
        self.epoch >= epoch && self.status.is_settled()
    }
}
