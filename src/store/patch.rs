//! Partial-update request for a task document and its pure application.
//!
//! Every backend loads the current row, calls [`TaskPatch::apply`], and
//! persists the result inside one atomic step per `(tenant, task)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::onboarding::model::{OnboardingTask, TaskData};

/// A shallow merge, a list of removals, and an optional completion mark.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// Top-level keys to set. Nested values replace the old value wholesale.
    #[serde(default)]
    pub merge: TaskData,
    /// Top-level keys to delete. Wins over `merge` for the same key.
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub mark_completed: bool,
}

impl TaskPatch {
    pub fn merge(merge: TaskData) -> Self {
        Self {
            merge,
            ..Default::default()
        }
    }

    pub fn complete() -> Self {
        Self {
            mark_completed: true,
            ..Default::default()
        }
    }

    pub fn with_remove<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_completed(mut self, mark_completed: bool) -> Self {
        self.mark_completed = mark_completed;
        self
    }

    /// Whether applying this patch can change anything.
    pub fn is_noop(&self) -> bool {
        self.merge.is_empty() && self.remove.is_empty() && !self.mark_completed
    }

    /// Apply to `task` in place.
    ///
    /// The completion timestamp is first-write-wins: an already completed task
    /// keeps its original `completed_at`.
    pub fn apply(&self, task: &mut OnboardingTask, now: DateTime<Utc>) {
        for (key, value) in &self.merge {
            task.data.insert(key.clone(), value.clone());
        }
        for key in &self.remove {
            task.data.remove(key);
        }
        if self.mark_completed && !task.is_completed {
            task.is_completed = true;
            task.completed_at = Some(now);
        }
        if task.is_completed && task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        task.updated_at = now;
    }
}
