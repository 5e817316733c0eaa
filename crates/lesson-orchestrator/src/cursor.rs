//! Position tracking through a nested (case, step) script.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::script::LessonScript;

/// Zero-based position of a step inside a [`LessonScript`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Cursor {
    /// Index into `script.cases`.
    pub case: usize,
    /// Index into that case's steps.
    pub step: usize,
}

impl Cursor {
    /// The position every run starts from.
    pub const START: Self = Self { case: 0, step: 0 };

    /// Creates a cursor.
    #[must_use]
    pub const fn new(case: usize, step: usize) -> Self {
        Self { case, step }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "case {} step {}", self.case, self.step)
    }
}

/// Returns the position after `cursor`, or `None` when the script is exhausted.
///
/// Moves to the next step of the same case if there is one, otherwise to the
/// first step of the next case. A following case with no steps still yields
/// `{case + 1, 0}`; executing that position is a no-op.
#[must_use]
pub fn next(script: &LessonScript, cursor: Cursor) -> Option<Cursor> {
    let case = script.cases.get(cursor.case)?;
    if cursor.step + 1 < case.steps.len() {
        return Some(Cursor::new(cursor.case, cursor.step + 1));
    }
    if cursor.case + 1 < script.cases.len() {
        return Some(Cursor::new(cursor.case + 1, 0));
    }
    None
}

/// Every position a run visits, in execution order.
#[derive(Debug, Clone)]
pub struct Positions<'a> {
    script: &'a LessonScript,
    current: Option<Cursor>,
}

impl<'a> Positions<'a> {
    /// Walks `script` from [`Cursor::START`].
    #[must_use]
    pub const fn new(script: &'a LessonScript) -> Self {
        Self {
            script,
            current: Some(Cursor::START),
        }
    }
}

impl Iterator for Positions<'_> {
    type Item = Cursor;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.current?;
        self.current = next(self.script, cursor);
        Some(cursor)
    }
}
