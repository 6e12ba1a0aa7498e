//! Task dependency graph — the fixed, ordered sequence of onboarding tasks.
//!
//! A task is locked while the task immediately before it is incomplete.
//! Lock state is never stored; it is derived from the task list every time.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Stable identifier of one onboarding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKey {
    Brand,
    Venue,
    Pos,
    Devices,
    Legal,
}

impl TaskKey {
    /// Every key, in canonical order.
    pub const ALL: [TaskKey; 5] = [
        TaskKey::Brand,
        TaskKey::Venue,
        TaskKey::Pos,
        TaskKey::Devices,
        TaskKey::Legal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brand => "brand",
            Self::Venue => "venue",
            Self::Pos => "pos",
            Self::Devices => "devices",
            Self::Legal => "legal",
        }
    }

    /// Human-readable label shown in the task list.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Brand => "Brand",
            Self::Venue => "Venue Setup",
            Self::Pos => "Point of Sale",
            Self::Devices => "Devices",
            Self::Legal => "Legal Signature",
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownTask(s.to_string()))
    }
}

/// Anything that can report whether a task is complete.
pub trait Completion {
    fn key(&self) -> TaskKey;
    fn is_completed(&self) -> bool;
}

/// The ordered task sequence. Process-wide configuration, shared by every tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    order: Vec<TaskKey>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self {
            order: TaskKey::ALL.to_vec(),
        }
    }
}

impl DependencyGraph {
    /// Build a graph from an explicit order.
    ///
    /// Panics if a key repeats: the order is static configuration and a
    /// duplicate is a programming error.
    pub fn new(order: Vec<TaskKey>) -> Self {
        for (i, key) in order.iter().enumerate() {
            assert!(
                !order[..i].contains(key),
                "task key {key} appears twice in the dependency order"
            );
        }
        Self { order }
    }

    pub fn keys(&self) -> &[TaskKey] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn first(&self) -> Option<TaskKey> {
        self.order.first().copied()
    }

    pub fn contains(&self, key: TaskKey) -> bool {
        self.order.contains(&key)
    }

    /// Parse a raw key, rejecting anything not in this graph.
    pub fn parse(&self, raw: &str) -> Result<TaskKey, ValidationError> {
        let key: TaskKey = raw.parse()?;
        if self.contains(key) {
            Ok(key)
        } else {
            Err(ValidationError::UnknownTask(raw.to_string()))
        }
    }

    /// Position of `key` in the order.
    ///
    /// Panics if the key is not configured.
    pub fn index_of(&self, key: TaskKey) -> usize {
        self.order
            .iter()
            .position(|k| *k == key)
            .unwrap_or_else(|| panic!("task key {key} is not part of the dependency order"))
    }

    /// The key immediately after `key`, or `None` for the last one.
    pub fn next_key(&self, key: TaskKey) -> Option<TaskKey> {
        self.order.get(self.index_of(key) + 1).copied()
    }

    /// The key immediately before `key`, or `None` for the first one.
    pub fn previous_key(&self, key: TaskKey) -> Option<TaskKey> {
        let idx = self.index_of(key);
        idx.checked_sub(1).map(|i| self.order[i])
    }

    /// Whether `key` is locked given the current task list.
    ///
    /// A predecessor with no row in `tasks` counts as incomplete.
    pub fn is_locked<T: Completion>(&self, key: TaskKey, tasks: &[T]) -> bool {
        match self.previous_key(key) {
            None => false,
            Some(prev) => !tasks
                .iter()
                .any(|t| t.key() == prev && t.is_completed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row(TaskKey, bool);

    impl Completion for Row {
        fn key(&self) -> TaskKey {
            self.0
        }
        fn is_completed(&self) -> bool {
            self.1
        }
    }

    fn rows(done: &[bool; 5]) -> Vec<Row> {
        TaskKey::ALL
            .iter()
            .zip(done)
            .map(|(k, d)| Row(*k, *d))
            .collect()
    }

    #[test]
    fn first_task_is_never_locked() {
        let graph = DependencyGraph::default();
        assert!(!graph.is_locked(TaskKey::Brand, &rows(&[false; 5])));
        assert!(!graph.is_locked(TaskKey::Brand, &Vec::<Row>::new()));
    }

    #[test]
    fn lock_follows_predecessor_for_every_combination() {
        let graph = DependencyGraph::default();
        for mask in 0u8..32 {
            let done: [bool; 5] = std::array::from_fn(|i| mask & (1 << i) != 0);
            let tasks = rows(&done);
            for (i, key) in TaskKey::ALL.iter().enumerate().skip(1) {
                assert_eq!(
                    graph.is_locked(*key, &tasks),
                    !done[i - 1],
                    "mask {mask:05b}, key {key}"
                );
            }
        }
    }

    #[test]
    fn next_key_walks_order() {
        let graph = DependencyGraph::default();
        assert_eq!(graph.next_key(TaskKey::Brand), Some(TaskKey::Venue));
        assert_eq!(graph.next_key(TaskKey::Devices), Some(TaskKey::Legal));
        assert_eq!(graph.next_key(TaskKey::Legal), None);
        assert_eq!(graph.previous_key(TaskKey::Brand), None);
        assert_eq!(graph.previous_key(TaskKey::Venue), Some(TaskKey::Brand));
    }

    #[test]
    fn custom_order_changes_locks() {
        let graph = DependencyGraph::new(vec![TaskKey::Legal, TaskKey::Brand]);
        let tasks = vec![Row(TaskKey::Legal, false), Row(TaskKey::Brand, false)];
        assert!(!graph.is_locked(TaskKey::Legal, &tasks));
        assert!(graph.is_locked(TaskKey::Brand, &tasks));
        assert_eq!(graph.next_key(TaskKey::Brand), None);
    }

    #[test]
    #[should_panic(expected = "appears twice")]
    fn duplicate_keys_are_rejected() {
        DependencyGraph::new(vec![TaskKey::Brand, TaskKey::Brand]);
    }

    #[test]
    fn parse_rejects_unknown_and_unconfigured_keys() {
        let graph = DependencyGraph::new(vec![TaskKey::Brand, TaskKey::Venue]);
        assert_eq!(graph.parse("venue"), Ok(TaskKey::Venue));
        assert_eq!(
            graph.parse("payroll"),
            Err(ValidationError::UnknownTask("payroll".into()))
        );
        assert_eq!(
            graph.parse("legal"),
            Err(ValidationError::UnknownTask("legal".into()))
        );
    }

    #[test]
    fn display_matches_serde() {
        for key in TaskKey::ALL {
            let json = serde_json::to_string(&key).unwrap();
            assert_eq!(format!("\"{key}\""), json);
        }
    }
}
