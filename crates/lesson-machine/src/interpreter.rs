//! Reference interpreter for flat JSON machine definitions.
//!
//! This module provides the [`Interpreter`] runtime, which turns a compiled
//! definition of the form
//!
//! ```json
//! {
//!   "id": "toggle",
//!   "initial": "off",
//!   "context": { "count": 0 },
//!   "states": {
//!     "off": { "on": { "TOGGLE": { "target": "on", "assign": { "count": 1 } } } },
//!     "on":  { "on": { "TOGGLE": "off", "FINISH": "done" } },
//!     "done": { "type": "final" }
//!   }
//! }
//! ```
//!
//! into a running [`FlatMachineInstance`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, trace};

use crate::{
    InstanceStatus, MachineError, MachineEvent, MachineInstance, MachineRuntime, MachineSnapshot,
};

/// Kind of a state node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Ordinary state.
    #[default]
    Atomic,
    /// Entering this state finishes the machine.
    Final,
}

/// A transition as written in a definition: either a bare target name or an
/// object with an optional target and context assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionDef {
    /// `"EVENT": "target"`.
    Target(String),
    /// `"EVENT": { "target": "...", "assign": { ... } }`.
    Detailed {
        /// Target state; `None` keeps the current state.
        #[serde(default)]
        target: Option<String>,
        /// Context keys to overwrite when the transition is taken.
        #[serde(default)]
        assign: Map<String, Value>,
    },
}

impl TransitionDef {
    /// Returns the target state, if the transition changes state.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Target(target) => Some(target),
            Self::Detailed { target, .. } => target.as_deref(),
        }
    }

    fn assignments(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Target(_) => None,
            Self::Detailed { assign, .. } => Some(assign),
        }
    }
}

/// One state of a flat machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    /// Whether this is a final state.
    #[serde(default, rename = "type")]
    pub kind: StateKind,

    /// Transitions keyed by event name.
    #[serde(default)]
    pub on: BTreeMap<String, TransitionDef>,
}

/// A validated flat machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatMachineDefinition {
    /// Optional machine identifier, used for logging.
    #[serde(default)]
    pub id: Option<String>,

    /// Name of the initial state.
    pub initial: String,

    /// Initial context object.
    #[serde(default)]
    pub context: Value,

    /// All states keyed by name.
    pub states: BTreeMap<String, StateNode>,
}

impl FlatMachineDefinition {
    /// Parses and validates a definition from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::InvalidDefinition`] if the value does not have
    /// the expected shape, and [`MachineError::UnknownState`] if the initial
    /// state or any transition target is not declared.
    pub fn from_value(value: &Value) -> Result<Self, MachineError> {
        let definition: Self = serde_json::from_value(value.clone())
            .map_err(|e| MachineError::InvalidDefinition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Checks internal consistency of the definition.
    ///
    /// # Errors
    ///
    /// See [`FlatMachineDefinition::from_value`].
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.states.is_empty() {
            return Err(MachineError::InvalidDefinition(
                "machine declares no states".to_string(),
            ));
        }

        if !matches!(self.context, Value::Null | Value::Object(_)) {
            return Err(MachineError::InvalidDefinition(
                "context must be an object".to_string(),
            ));
        }

        if !self.states.contains_key(&self.initial) {
            return Err(MachineError::UnknownState(self.initial.clone()));
        }

        for (name, node) in &self.states {
            for (event, transition) in &node.on {
                if event.is_empty() {
                    return Err(MachineError::InvalidDefinition(format!(
                        "state '{name}' has a transition with an empty event name"
                    )));
                }
                if let Some(target) = transition.target() {
                    if !self.states.contains_key(target) {
                        return Err(MachineError::UnknownState(target.to_string()));
                    }
                }
            }
        }

        Ok(())
    }

    fn initial_context(&self) -> Value {
        match &self.context {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        }
    }

    fn is_final(&self, state: &str) -> bool {
        self.states
            .get(state)
            .is_some_and(|node| node.kind == StateKind::Final)
    }
}

/// Runtime for [`FlatMachineDefinition`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    /// Creates the interpreter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl MachineRuntime for Interpreter {
    #[instrument(skip_all)]
    fn instantiate(&self, definition: &Value) -> Result<Box<dyn MachineInstance>, MachineError> {
        let definition = FlatMachineDefinition::from_value(definition)?;
        debug!(
            machine_id = definition.id.as_deref().unwrap_or("<anonymous>"),
            states = definition.states.len(),
            "Instantiating machine"
        );
        Ok(Box::new(FlatMachineInstance::new(definition)))
    }
}

/// A running flat machine.
#[derive(Debug, Clone)]
pub struct FlatMachineInstance {
    definition: FlatMachineDefinition,
    current: String,
    context: Value,
    status: InstanceStatus,
}

impl FlatMachineInstance {
    /// Creates a not yet started instance of `definition`.
    #[must_use]
    pub fn new(definition: FlatMachineDefinition) -> Self {
        let current = definition.initial.clone();
        let context = definition.initial_context();
        Self {
            definition,
            current,
            context,
            status: InstanceStatus::NotStarted,
        }
    }

    fn finish_if_final(&mut self) {
        if self.definition.is_final(&self.current) {
            debug!(state = %self.current, "Machine reached final state");
            self.status = InstanceStatus::Stopped;
        }
    }
}

impl MachineInstance for FlatMachineInstance {
    fn start(&mut self) -> Result<(), MachineError> {
        if self.status != InstanceStatus::NotStarted {
            return Err(MachineError::InvalidStatus {
                expected: InstanceStatus::NotStarted,
                actual: self.status,
            });
        }
        self.status = InstanceStatus::Running;
        self.finish_if_final();
        Ok(())
    }

    fn current_state(&self) -> MachineSnapshot {
        MachineSnapshot {
            value: self.current.clone(),
            context: self.context.clone(),
            done: self.definition.is_final(&self.current),
        }
    }

    fn send(&mut self, event: &MachineEvent) -> Result<(), MachineError> {
        if self.status != InstanceStatus::Running {
            return Err(MachineError::InvalidStatus {
                expected: InstanceStatus::Running,
                actual: self.status,
            });
        }

        let Some(transition) = self
            .definition
            .states
            .get(&self.current)
            .and_then(|node| node.on.get(&event.kind))
            .cloned()
        else {
            trace!(state = %self.current, event = %event.kind, "Event not handled");
            return Ok(());
        };

        if let (Some(assignments), Value::Object(context)) =
            (transition.assignments(), &mut self.context)
        {
            for (key, value) in assignments {
                context.insert(key.clone(), value.clone());
            }
        }

        if let Some(target) = transition.target() {
            trace!(from = %self.current, to = %target, event = %event.kind, "Transition");
            self.current = target.to_string();
        }

        self.finish_if_final();
        Ok(())
    }

    fn stop(&mut self) {
        self.status = InstanceStatus::Stopped;
    }

    fn status(&self) -> InstanceStatus {
        self.status
    }
}
