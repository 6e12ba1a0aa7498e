//! Progression engine — derives the ordered task view, progress, and status.
//!
//! Pure and read-only: the view is rebuilt from the current rows on every
//! read and never cached.

use super::graph::DependencyGraph;
use super::model::{OnboardingTask, OnboardingView, TaskData, TaskView, Tenant};

/// `round(100 * completed / total)`, 0 for an empty list.
pub fn progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 * 100.0) / total as f64).round() as u8
}

/// Ordered task list with completion and lock flags.
///
/// Rows are matched by key; a key with no row shows as an empty, incomplete
/// task. Rows whose key is not in the graph are ignored.
pub fn task_views(graph: &DependencyGraph, tasks: &[OnboardingTask]) -> Vec<TaskView> {
    graph
        .keys()
        .iter()
        .map(|key| {
            let row = tasks.iter().find(|t| t.task_key == *key);
            TaskView {
                key: *key,
                name: key.display_name().to_string(),
                is_completed: row.is_some_and(|t| t.is_completed),
                is_locked: graph.is_locked(*key, tasks),
                completed_at: row.and_then(|t| t.completed_at),
                data: row.map(|t| t.data.clone()).unwrap_or_else(TaskData::new),
            }
        })
        .collect()
}

/// Build the full view of a tenant.
pub fn build_view(
    graph: &DependencyGraph,
    tenant: &Tenant,
    tasks: &[OnboardingTask],
) -> OnboardingView {
    let tasks = task_views(graph, tasks);
    let completed = tasks.iter().filter(|t| t.is_completed).count();
    let next_task = tasks
        .iter()
        .find(|t| !t.is_completed && !t.is_locked)
        .map(|t| t.key);

    OnboardingView {
        tenant_id: tenant.id,
        phase: tenant.phase,
        phase_started_at: tenant.phase_started_at,
        status: tenant.phase.status(),
        progress: progress(completed, tasks.len()),
        tasks,
        next_task,
    }
}
