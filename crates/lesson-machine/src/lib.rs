//! Lesson Runner machine runtime
//!
//! Runtime contract for running learner-defined state machines.
//!
//! This crate defines the interface the grading orchestrator uses to talk to
//! a live machine instance ([`MachineInstance`]), the factory that turns an
//! opaque compiled definition into one ([`MachineRuntime`]), and a scoped
//! ownership wrapper ([`InstanceLease`]) that guarantees the instance is
//! stopped when it goes away. A reference [`Interpreter`] for flat JSON
//! machine definitions lives in [`interpreter`].

pub mod interpreter;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use interpreter::{FlatMachineDefinition, FlatMachineInstance, Interpreter, StateKind};

/// Errors raised by a machine runtime or a running instance.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The definition handed to the runtime cannot be interpreted.
    #[error("invalid machine definition: {0}")]
    InvalidDefinition(String),

    /// A transition or the initial state names a state that does not exist.
    #[error("unknown state: {0}")]
    UnknownState(String),

    /// The instance is not in a status that allows the requested operation.
    #[error("invalid instance status: expected {expected}, found {actual}")]
    InvalidStatus {
        /// The status the operation requires.
        expected: InstanceStatus,
        /// The status the instance is actually in.
        actual: InstanceStatus,
    },
}

/// Lifecycle status of a machine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance has been created but not started.
    #[default]
    NotStarted,
    /// Instance is running and accepts events.
    Running,
    /// Instance has been stopped; terminal.
    Stopped,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// An event delivered to a running machine.
///
/// Serialized as `{"type": "NAME", "payload": ...}`; the payload is omitted
/// when null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineEvent {
    /// Event name, matched against the machine's transition table.
    #[serde(rename = "type")]
    pub kind: String,

    /// Optional event data.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl MachineEvent {
    /// Creates an event with no payload.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
        }
    }

    /// Attaches a payload to the event.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Observable state of a machine at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// Name of the active state.
    pub value: String,

    /// Extended state (the machine's context object).
    #[serde(default)]
    pub context: Value,

    /// Whether the machine has reached a final state.
    #[serde(default)]
    pub done: bool,
}

impl MachineSnapshot {
    /// Creates a snapshot in the given state with an empty context.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            context: Value::Object(serde_json::Map::new()),
            done: false,
        }
    }

    /// Attaches a context object.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Returns `true` if the active state is `state`.
    #[must_use]
    pub fn matches(&self, state: &str) -> bool {
        self.value == state
    }

    /// Looks up a top-level context key.
    #[must_use]
    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }
}

/// A live, running machine.
///
/// Instances are exclusively owned by one caller; `current_state` is
/// readable at any time, `send` is only valid while running.
pub trait MachineInstance: Send {
    /// Starts the machine in its initial state.
    fn start(&mut self) -> Result<(), MachineError>;

    /// Returns the current observable state.
    fn current_state(&self) -> MachineSnapshot;

    /// Delivers an event to the machine.
    fn send(&mut self, event: &MachineEvent) -> Result<(), MachineError>;

    /// Stops the machine. Stopping a stopped machine is a no-op.
    fn stop(&mut self);

    /// Returns the lifecycle status.
    fn status(&self) -> InstanceStatus;

    /// Returns `true` while the machine accepts events.
    fn is_running(&self) -> bool {
        self.status() == InstanceStatus::Running
    }
}

/// Builds machine instances from compiled definitions.
///
/// The definition is opaque to callers; only the runtime knows its shape.
pub trait MachineRuntime: Send + Sync {
    /// Creates a new, not yet started, instance from `definition`.
    fn instantiate(&self, definition: &Value) -> Result<Box<dyn MachineInstance>, MachineError>;
}

/// Exclusive, scoped ownership of a running instance.
///
/// The instance is stopped when the lease is released or dropped, whichever
/// comes first, so no instance outlives its holder.
pub struct InstanceLease {
    instance: Box<dyn MachineInstance>,
    acquired_at: DateTime<Utc>,
}

impl InstanceLease {
    /// Takes ownership of `instance`.
    #[must_use]
    pub fn new(instance: Box<dyn MachineInstance>) -> Self {
        Self {
            instance,
            acquired_at: Utc::now(),
        }
    }

    /// Returns the leased instance.
    #[must_use]
    pub fn instance(&self) -> &dyn MachineInstance {
        self.instance.as_ref()
    }

    /// Returns the leased instance mutably.
    pub fn instance_mut(&mut self) -> &mut dyn MachineInstance {
        self.instance.as_mut()
    }

    /// Stops the instance and ends the lease.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if self.instance.is_running() {
            self.instance.stop();
            debug!(acquired_at = %self.acquired_at, "Stopped leased machine instance");
        }
    }
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLease")
            .field("status", &self.instance.status())
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingInstance {
        status: InstanceStatus,
        stops: Arc<AtomicUsize>,
    }

    impl MachineInstance for CountingInstance {
        fn start(&mut self) -> Result<(), MachineError> {
            self.status = InstanceStatus::Running;
            Ok(())
        }

        fn current_state(&self) -> MachineSnapshot {
            MachineSnapshot::new("idle")
        }

        fn send(&mut self, _event: &MachineEvent) -> Result<(), MachineError> {
            Ok(())
        }

        fn stop(&mut self) {
            self.status = InstanceStatus::Stopped;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn status(&self) -> InstanceStatus {
            self.status
        }
    }

    fn running_instance(stops: &Arc<AtomicUsize>) -> Box<dyn MachineInstance> {
        Box::new(CountingInstance {
            status: InstanceStatus::Running,
            stops: Arc::clone(stops),
        })
    }

    #[test]
    fn instance_status_default_is_not_started() {
        assert_eq!(InstanceStatus::default(), InstanceStatus::NotStarted);
    }

    #[test]
    fn instance_status_display() {
        assert_eq!(InstanceStatus::NotStarted.to_string(), "not_started");
        assert_eq!(InstanceStatus::Running.to_string(), "running");
        assert_eq!(InstanceStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn machine_event_omits_null_payload() {
        let json = serde_json::to_string(&MachineEvent::new("TOGGLE")).unwrap_or_default();
        assert_eq!(json, r#"{"type":"TOGGLE"}"#);

        let event = MachineEvent::new("SET").with_payload(serde_json::json!({"n": 2}));
        let json = serde_json::to_string(&event).unwrap_or_default();
        assert_eq!(json, r#"{"type":"SET","payload":{"n":2}}"#);
    }

    #[test]
    fn snapshot_matches_and_reads_context() {
        let snapshot = MachineSnapshot::new("on").with_context(serde_json::json!({"count": 3}));
        assert!(snapshot.matches("on"));
        assert!(!snapshot.matches("off"));
        assert_eq!(snapshot.context_value("count"), Some(&serde_json::json!(3)));
        assert!(snapshot.context_value("missing").is_none());
    }

    #[test]
    fn lease_release_stops_running_instance() {
        let stops = Arc::new(AtomicUsize::new(0));
        let lease = InstanceLease::new(running_instance(&stops));
        assert!(lease.instance().is_running());

        lease.release();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_drop_stops_running_instance() {
        let stops = Arc::new(AtomicUsize::new(0));
        {
            let _lease = InstanceLease::new(running_instance(&stops));
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_does_not_stop_an_already_stopped_instance() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut lease = InstanceLease::new(running_instance(&stops));
        lease.instance_mut().stop();
        lease.release();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
