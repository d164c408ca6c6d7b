//! Curriculum layout and cursor navigation.

use serde_json::Value;
use tutor_core::{Position, TutorError, TutorResult};

/// One navigable unit: a whole lesson or a single step of one.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub lesson: usize,
    pub payload: Value,
}

impl Entry {
    /// Autopilot lines attached to this entry, if any.
    pub fn script(&self) -> Option<Vec<String>> {
        let lines = self.payload.get("script")?.as_array()?;
        Some(
            lines
                .iter()
                .filter_map(|line| line.as_str().map(str::to_string))
                .collect(),
        )
    }
}

/// Course content flattened into entries. Entry 0 is the introduction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Curriculum {
    entries: Vec<Entry>,
}

impl Curriculum {
    /// Flatten `{"lessons": [...]}`: a lesson with a non-empty `steps` array
    /// contributes one entry per step, any other lesson a single entry. The
    /// introduction always contributes exactly one.
    pub fn from_course(course: &Value) -> Self {
        let lessons = course
            .get("lessons")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut entries = Vec::new();
        for (lesson, content) in lessons.iter().enumerate() {
            let steps = content
                .get("steps")
                .and_then(Value::as_array)
                .filter(|steps| lesson > 0 && !steps.is_empty());

            match steps {
                Some(steps) => entries.extend(steps.iter().map(|step| Entry {
                    lesson,
                    payload: step.clone(),
                })),
                None => entries.push(Entry {
                    lesson,
                    payload: content.clone(),
                }),
            }
        }
        Self { entries }
    }

    /// Navigable entries; the introduction is not counted.
    pub fn len(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, n: usize) -> Option<&Entry> {
        self.entries.get(n)
    }

    /// Lesson index of entry `n`.
    pub fn lesson_of(&self, n: usize) -> Option<usize> {
        self.entry(n).map(|e| e.lesson)
    }

    pub fn position(&self, n: usize) -> Option<Position> {
        let entry = self.entry(n)?;
        Some(Position {
            n,
            outof: self.len(),
            lesson: entry.lesson,
            entry: entry.payload.clone(),
        })
    }
}

/// Cursor over `1..=bound`. Zero means not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Navigator {
    cursor: usize,
    bound: usize,
}

impl Navigator {
    pub fn new(bound: usize) -> Self {
        Self { cursor: 0, bound }
    }

    /// Place the cursor on the first lesson.
    pub fn start(&mut self) -> TutorResult<usize> {
        if self.bound == 0 {
            return Err(TutorError::OutOfRange);
        }
        self.cursor = 1;
        Ok(self.cursor)
    }

    pub fn is_started(&self) -> bool {
        self.cursor > 0
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn next(&mut self) -> TutorResult<usize> {
        self.ensure_started()?;
        self.move_to(self.cursor + 1)
    }

    /// Step back; the introduction is never reachable, so `back` at 1 fails.
    pub fn back(&mut self) -> TutorResult<usize> {
        self.ensure_started()?;
        self.move_to(self.cursor - 1)
    }

    pub fn seek(&mut self, n: i64) -> TutorResult<usize> {
        self.ensure_started()?;
        if n < 1 {
            return Err(TutorError::InvalidLesson(n));
        }
        let n = usize::try_from(n).map_err(|_| TutorError::OutOfRange)?;
        self.move_to(n)
    }

    /// Put the cursor back after a navigation whose side effects failed.
    pub fn revert(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    fn move_to(&mut self, n: usize) -> TutorResult<usize> {
        if n < 1 || n > self.bound {
            return Err(TutorError::OutOfRange);
        }
        self.cursor = n;
        Ok(n)
    }

    fn ensure_started(&self) -> TutorResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(TutorError::NotStarted)
        }
    }
}
