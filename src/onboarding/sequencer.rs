//! Step sequencer — presentation choreography after a task completes.
//!
//! `Idle → Completing → Collapsing → Activating → Idle`, each step held for a
//! fixed delay. Holds no persisted state; the current state is published on a
//! `watch` channel for whatever renders the task list.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::graph::{Completion, DependencyGraph, TaskKey};
use crate::config::StepTimings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    #[default]
    Idle,
    Completing,
    Collapsing,
    Activating,
}

/// What the task list should currently look like.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SequencerState {
    pub phase: StepPhase,
    /// Task whose panel is open, if any.
    pub expanded: Option<TaskKey>,
    /// Task showing the "just completed" marker.
    pub just_completed: Option<TaskKey>,
    /// Task showing the "unlocking" marker.
    pub unlocking: Option<TaskKey>,
}

pub struct StepSequencer {
    graph: DependencyGraph,
    timings: StepTimings,
    tx: watch::Sender<SequencerState>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl StepSequencer {
    pub fn new(graph: DependencyGraph, timings: StepTimings) -> Arc<Self> {
        let (tx, _rx) = watch::channel(SequencerState::default());
        Arc::new(Self {
            graph,
            timings,
            tx,
            running: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SequencerState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> SequencerState {
        self.tx.borrow().clone()
    }

    /// Open a panel directly (user click), outside of any sequence.
    pub fn expand(&self, key: Option<TaskKey>) {
        self.tx.send_modify(|s| s.expanded = key);
    }

    /// Start the sequence for `key` in the background.
    ///
    /// A sequence already running is cancelled and this one starts over.
    /// `tasks` is the task list as of the completing write.
    pub fn step_complete<T>(self: &Arc<Self>, key: TaskKey, tasks: Vec<T>)
    where
        T: Completion + Send + Sync + 'static,
    {
        // Held across abort and spawn so the stored handle is always the newest.
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = running.take() {
            previous.abort();
        }
        let this = Arc::clone(self);
        *running = Some(tokio::spawn(async move { this.run(key, &tasks).await }));
    }

    /// Run the whole sequence for `key` and return once back in `Idle`.
    pub async fn run<T: Completion>(&self, key: TaskKey, tasks: &[T]) {
        debug!(task = %key, "Step sequence started");
        self.tx.send_modify(|s| {
            s.phase = StepPhase::Completing;
            s.just_completed = Some(key);
            s.unlocking = None;
        });
        tokio::time::sleep(self.timings.completing).await;

        self.tx.send_modify(|s| {
            s.phase = StepPhase::Collapsing;
            s.expanded = None;
        });
        tokio::time::sleep(self.timings.collapsing).await;

        let next = self
            .graph
            .next_key(key)
            .filter(|next| !self.graph.is_locked(*next, tasks));
        if let Some(next) = next {
            self.tx.send_modify(|s| {
                s.phase = StepPhase::Activating;
                s.expanded = Some(next);
                s.unlocking = Some(next);
            });
            tokio::time::sleep(self.timings.activating).await;
        }

        self.tx.send_modify(|s| {
            s.phase = StepPhase::Idle;
            s.just_completed = None;
            s.unlocking = None;
        });
        debug!(task = %key, next = ?next, "Step sequence finished");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Clone)]
    struct Row(TaskKey, bool);

    impl Completion for Row {
        fn key(&self) -> TaskKey {
            self.0
        }
        fn is_completed(&self) -> bool {
            self.1
        }
    }

    fn timings() -> StepTimings {
        StepTimings {
            completing: Duration::from_millis(600),
            collapsing: Duration::from_millis(400),
            activating: Duration::from_millis(900),
        }
    }

    fn after_brand() -> Vec<Row> {
        TaskKey::ALL
            .iter()
            .map(|k| Row(*k, *k == TaskKey::Brand))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn walks_states_in_order() {
        let seq = StepSequencer::new(DependencyGraph::default(), timings());
        seq.expand(Some(TaskKey::Brand));
        seq.step_complete(TaskKey::Brand, after_brand());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let s = seq.state();
        assert_eq!(s.phase, StepPhase::Completing);
        assert_eq!(s.just_completed, Some(TaskKey::Brand));
        assert_eq!(s.expanded, Some(TaskKey::Brand));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let s = seq.state();
        assert_eq!(s.phase, StepPhase::Collapsing);
        assert_eq!(s.expanded, None);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let s = seq.state();
        assert_eq!(s.phase, StepPhase::Activating);
        assert_eq!(s.expanded, Some(TaskKey::Venue));
        assert_eq!(s.unlocking, Some(TaskKey::Venue));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let s = seq.state();
        assert_eq!(s.phase, StepPhase::Idle);
        assert_eq!(s.expanded, Some(TaskKey::Venue));
        assert_eq!(s.just_completed, None);
        assert_eq!(s.unlocking, None);
    }

    #[tokio::test(start_paused = true)]
    async fn last_task_skips_activation() {
        let seq = StepSequencer::new(DependencyGraph::default(), timings());
        let all_done: Vec<Row> = TaskKey::ALL.iter().map(|k| Row(*k, true)).collect();

        let started = tokio::time::Instant::now();
        seq.run(TaskKey::Legal, &all_done).await;
        assert_eq!(started.elapsed(), Duration::from_millis(1000));

        let s = seq.state();
        assert_eq!(s.phase, StepPhase::Idle);
        assert_eq!(s.expanded, None);
    }

    #[tokio::test(start_paused = true)]
    async fn locked_next_task_is_not_opened() {
        let seq = StepSequencer::new(DependencyGraph::default(), timings());
        // Brand reported complete but the snapshot still says incomplete.
        let stale: Vec<Row> = TaskKey::ALL.iter().map(|k| Row(*k, false)).collect();
        seq.run(TaskKey::Brand, &stale).await;
        assert_eq!(seq.state().expanded, None);
    }

    #[tokio::test(start_paused = true)]
    async fn new_completion_restarts_sequence() {
        let seq = StepSequencer::new(DependencyGraph::default(), timings());
        seq.step_complete(TaskKey::Brand, after_brand());
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(seq.state().phase, StepPhase::Collapsing);

        let mut rows = after_brand();
        rows[1].1 = true;
        seq.step_complete(TaskKey::Venue, rows);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let s = seq.state();
        assert_eq!(s.phase, StepPhase::Completing);
        assert_eq!(s.just_completed, Some(TaskKey::Venue));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(seq.state().expanded, Some(TaskKey::Pos));
    }

    /// Counts reads of its completion flag, so a test can tell how many
    /// sequences got as far as the lock check.
    struct Counted {
        key: TaskKey,
        done: bool,
        reads: Arc<AtomicUsize>,
    }

    impl Completion for Counted {
        fn key(&self) -> TaskKey {
            self.key
        }
        fn is_completed(&self) -> bool {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.done
        }
    }

    fn counted(reads: &Arc<AtomicUsize>) -> Vec<Counted> {
        TaskKey::ALL
            .iter()
            .map(|k| Counted {
                key: *k,
                done: *k == TaskKey::Brand,
                reads: Arc::clone(reads),
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_leave_one_sequence_running() {
        let fast = StepTimings {
            completing: Duration::from_millis(20),
            collapsing: Duration::from_millis(20),
            activating: Duration::from_millis(20),
        };

        // Reads made by a single uninterrupted sequence.
        let reads = Arc::new(AtomicUsize::new(0));
        let seq = StepSequencer::new(DependencyGraph::default(), fast);
        seq.run(TaskKey::Brand, &counted(&reads)).await;
        let single = reads.load(Ordering::SeqCst);
        assert!(single > 0);

        let reads = Arc::new(AtomicUsize::new(0));
        let seq = StepSequencer::new(DependencyGraph::default(), fast);
        let callers: Vec<_> = (0..16)
            .map(|_| {
                let seq = Arc::clone(&seq);
                let rows = counted(&reads);
                tokio::spawn(async move { seq.step_complete(TaskKey::Brand, rows) })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reads.load(Ordering::SeqCst), single);
        let s = seq.state();
        assert_eq!(s.phase, StepPhase::Idle);
        assert_eq!(s.expanded, Some(TaskKey::Venue));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_changes() {
        let seq = StepSequencer::new(DependencyGraph::default(), timings());
        let mut rx = seq.subscribe();
        seq.step_complete(TaskKey::Brand, after_brand());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().phase, StepPhase::Completing);
    }
}
