//! Acceptance-criteria scripts.
//!
//! A [`LessonScript`] is an ordered list of [`Case`]s, each an ordered list
//! of [`Step`]s. Scripts are either built in code (arbitrary predicates) or
//! loaded from a lesson file whose assertions are declarative
//! [`Expectation`]s. Once loaded a script is immutable and shared behind an
//! `Arc`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use lesson_machine::{MachineEvent, MachineSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cursor::Cursor;
use crate::error::{GraderError, Result};

/// Maximum allowed lesson file size in bytes (1MB).
pub const MAX_LESSON_SIZE: u64 = 1024 * 1024;

type PredicateFn = dyn Fn(&MachineSnapshot) -> bool + Send + Sync;

/// A boolean check over a machine snapshot.
#[derive(Clone)]
pub struct Predicate(Arc<PredicateFn>);

impl Predicate {
    /// Wraps a closure.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&MachineSnapshot) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(check))
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn evaluate(&self, snapshot: &MachineSnapshot) -> bool {
        (self.0)(snapshot)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// A described predicate over the machine's observable state.
#[derive(Debug, Clone)]
pub struct Assertion {
    /// Human-readable description, shown when the assertion fails.
    pub description: String,
    predicate: Predicate,
}

impl Assertion {
    /// Creates an assertion from a description and a predicate closure.
    pub fn new<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&MachineSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Predicate::new(check),
        }
    }

    /// Returns `true` if `snapshot` satisfies the assertion.
    #[must_use]
    pub fn holds(&self, snapshot: &MachineSnapshot) -> bool {
        self.predicate.evaluate(snapshot)
    }
}

/// One scripted action.
#[derive(Debug, Clone)]
pub enum Step {
    /// Check the instance's current state.
    Assertion(Assertion),
    /// Deliver an event to the instance.
    SendEvent(MachineEvent),
}

impl Step {
    /// Shorthand for an assertion step.
    pub fn assertion<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&MachineSnapshot) -> bool + Send + Sync + 'static,
    {
        Self::Assertion(Assertion::new(description, check))
    }

    /// Shorthand for an assertion that the machine is in `state`.
    #[must_use]
    pub fn expect_state(state: impl Into<String>) -> Self {
        let state = state.into();
        let description = format!("machine is in '{state}'");
        Self::assertion(description, move |snapshot| snapshot.matches(&state))
    }

    /// Shorthand for a send-event step with no payload.
    #[must_use]
    pub fn send(kind: impl Into<String>) -> Self {
        Self::SendEvent(MachineEvent::new(kind))
    }

    /// Short label used in outlines and logs.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Assertion(assertion) => assertion.description.clone(),
            Self::SendEvent(event) => format!("send {}", event.kind),
        }
    }

    /// The kind of step, without its payload.
    #[must_use]
    pub const fn kind(&self) -> StepKind {
        match self {
            Self::Assertion(_) => StepKind::Assertion,
            Self::SendEvent(_) => StepKind::SendEvent,
        }
    }
}

/// Discriminant of a [`Step`], as written in lesson files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// An assertion step.
    Assertion,
    /// A send-event step.
    SendEvent,
}

/// A named, ordered group of steps.
#[derive(Debug, Clone, Default)]
pub struct Case {
    /// Case name.
    pub name: String,
    /// Steps, executed in order.
    pub steps: Vec<Step>,
}

impl Case {
    /// Creates an empty case.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}

/// The full acceptance-criteria script of a lesson.
#[derive(Debug, Clone, Default)]
pub struct LessonScript {
    /// Lesson title.
    pub title: String,
    /// Cases, executed in order.
    pub cases: Vec<Case>,
}

impl LessonScript {
    /// Creates a script with no cases.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            cases: Vec::new(),
        }
    }

    /// Appends a case.
    #[must_use]
    pub fn with_case(mut self, case: Case) -> Self {
        self.cases.push(case);
        self
    }

    /// Returns the step at `cursor`, if there is one.
    #[must_use]
    pub fn step_at(&self, cursor: Cursor) -> Option<&Step> {
        self.cases.get(cursor.case)?.steps.get(cursor.step)
    }

    /// Total number of steps across all cases.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.cases.iter().map(|case| case.steps.len()).sum()
    }

    /// Returns `true` if the script has no cases.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Loads a script from a lesson file.
    ///
    /// # Errors
    ///
    /// Returns `GraderError::LessonNotFound` if the file doesn't exist.
    /// Returns `GraderError::LessonTooLarge` if the file exceeds 1MB.
    /// Returns `GraderError::LessonEncodingError` if the file is not valid UTF-8.
    /// Returns `GraderError::LessonParseError` if the content is not a lesson.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GraderError::lesson_not_found(path)
            } else {
                GraderError::Io(e)
            }
        })?;

        let file_size = metadata.len();
        if file_size > MAX_LESSON_SIZE {
            return Err(GraderError::lesson_too_large(path, file_size / 1024));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                GraderError::lesson_encoding(path)
            } else {
                GraderError::Io(e)
            }
        })?;

        Self::parse(&content).map_err(|message| GraderError::lesson_parse(path, message))
    }

    /// Parses a lesson document.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if `json` is not a valid lesson.
    pub fn parse(json: &str) -> std::result::Result<Self, String> {
        let document: LessonDocument = serde_json::from_str(json).map_err(|e| e.to_string())?;
        document.into_script()
    }

    /// Serializable summary of the script for clients.
    #[must_use]
    pub fn outline(&self) -> LessonOutline {
        LessonOutline {
            title: self.title.clone(),
            total_steps: self.total_steps(),
            cases: self
                .cases
                .iter()
                .map(|case| CaseOutline {
                    name: case.name.clone(),
                    steps: case
                        .steps
                        .iter()
                        .map(|step| StepOutline {
                            kind: step.kind(),
                            label: step.label(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Lesson summary served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonOutline {
    /// Lesson title.
    pub title: String,
    /// Number of steps across all cases.
    pub total_steps: usize,
    /// Cases in execution order.
    pub cases: Vec<CaseOutline>,
}

/// One case in a [`LessonOutline`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOutline {
    /// Case name.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<StepOutline>,
}

/// One step in a [`CaseOutline`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutline {
    /// Step kind.
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Step label.
    pub label: String,
}

// ============================================================================
// Lesson file format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LessonDocument {
    #[serde(default)]
    title: String,
    acceptance_criteria: CriteriaDocument,
}

#[derive(Debug, Deserialize)]
struct CriteriaDocument {
    #[serde(default)]
    cases: Vec<CaseDocument>,
}

#[derive(Debug, Deserialize)]
struct CaseDocument {
    #[serde(default)]
    name: String,
    #[serde(default)]
    steps: Vec<StepDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum StepDocument {
    Assertion {
        #[serde(default)]
        description: Option<String>,
        expect: Expectation,
    },
    SendEvent {
        event: MachineEvent,
    },
}

/// Declarative assertion used in lesson files.
///
/// Every field that is present must match; `context` is compared key by key
/// against the top level of the machine's context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    /// Expected active state.
    #[serde(default)]
    pub state: Option<String>,
    /// Expected context entries.
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

impl Expectation {
    /// Returns `true` if `snapshot` satisfies every present field.
    #[must_use]
    pub fn matches(&self, snapshot: &MachineSnapshot) -> bool {
        let state_ok = self
            .state
            .as_deref()
            .map_or(true, |state| snapshot.matches(state));
        let context_ok = self.context.as_ref().map_or(true, |expected| {
            expected
                .iter()
                .all(|(key, value)| snapshot.context_value(key) == Some(value))
        });
        state_ok && context_ok
    }

    /// Returns `true` if nothing is checked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.context.as_ref().map_or(true, Map::is_empty)
    }

    fn describe(&self) -> String {
        match (&self.state, &self.context) {
            (Some(state), Some(context)) if !context.is_empty() => format!(
                "machine is in '{state}' with context {}",
                Value::Object(context.clone())
            ),
            (Some(state), _) => format!("machine is in '{state}'"),
            (None, Some(context)) => {
                format!("context matches {}", Value::Object(context.clone()))
            }
            (None, None) => "always holds".to_string(),
        }
    }

    fn into_assertion(self, description: Option<String>) -> Assertion {
        let description = description.unwrap_or_else(|| self.describe());
        Assertion::new(description, move |snapshot| self.matches(snapshot))
    }
}

impl LessonDocument {
    fn into_script(self) -> std::result::Result<LessonScript, String> {
        let mut cases = Vec::with_capacity(self.acceptance_criteria.cases.len());
        for (case_index, case) in self.acceptance_criteria.cases.into_iter().enumerate() {
            let mut steps = Vec::with_capacity(case.steps.len());
            for (step_index, step) in case.steps.into_iter().enumerate() {
                let step = match step {
                    StepDocument::Assertion {
                        description,
                        expect,
                    } => {
                        if expect.is_empty() {
                            return Err(format!(
                                "case {case_index} step {step_index}: assertion has an empty 'expect'"
                            ));
                        }
                        Step::Assertion(expect.into_assertion(description))
                    }
                    StepDocument::SendEvent { event } => {
                        if event.kind.trim().is_empty() {
                            return Err(format!(
                                "case {case_index} step {step_index}: event type must not be empty"
                            ));
                        }
                        Step::SendEvent(event)
                    }
                };
                steps.push(step);
            }
            cases.push(Case {
                name: case.name,
                steps,
            });
        }

        Ok(LessonScript {
            title: self.title,
            cases,
        })
    }
}
