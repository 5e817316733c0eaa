//! Runs single script steps against a live machine instance.

use lesson_machine::MachineInstance;
use tracing::{debug, trace, warn};

use crate::cursor::Cursor;
use crate::error::AssertionFailure;
use crate::script::{LessonScript, Step};

/// Executes one step.
///
/// Assertions read the instance's current state and fail when the predicate
/// returns `false`. Sent events never fail here: an error reported by the
/// instance is logged and dropped.
///
/// # Errors
///
/// Returns [`AssertionFailure`] when an assertion does not hold.
pub fn execute(step: &Step, instance: &mut dyn MachineInstance) -> Result<(), AssertionFailure> {
    match step {
        Step::Assertion(assertion) => {
            let observed = instance.current_state();
            if assertion.holds(&observed) {
                trace!(description = %assertion.description, state = %observed.value, "Assertion held");
                Ok(())
            } else {
                Err(AssertionFailure {
                    description: assertion.description.clone(),
                    observed,
                })
            }
        }
        Step::SendEvent(event) => {
            if let Err(e) = instance.send(event) {
                warn!(event = %event.kind, error = %e, "Machine rejected event, continuing");
            }
            Ok(())
        }
    }
}

/// Executes the step at `cursor`.
///
/// A cursor that names no step, or a missing instance, counts as success so
/// the run can proceed to the next position.
///
/// # Errors
///
/// Returns [`AssertionFailure`] when the step is an assertion that does not hold.
pub fn execute_at(
    script: &LessonScript,
    cursor: Cursor,
    instance: Option<&mut dyn MachineInstance>,
) -> Result<(), AssertionFailure> {
    let Some(step) = script.step_at(cursor) else {
        debug!(%cursor, "No step at cursor, treating as success");
        return Ok(());
    };
    let Some(instance) = instance else {
        warn!(%cursor, step = %step.label(), "No machine instance, skipping step");
        return Ok(());
    };
    execute(step, instance)
}
