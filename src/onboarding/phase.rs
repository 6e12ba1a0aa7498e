//! Phase controller — moves a tenant from `onboarding` to `reviewing` once
//! every task is complete.
//!
//! Completion is observed repeatedly (every refresh, every task write), so the
//! controller keeps a single-flight guard per tenant: while one transition
//! request is outstanding, further observations for that tenant are skipped.
//! The store update itself is a compare-and-set on the current phase, so a
//! stale observation after a settled transition cannot fire it again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::graph::{Completion, DependencyGraph};
use super::model::{Tenant, TenantPhase};
use crate::store::Database;

/// What one observation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Tenant is not in `onboarding`, or some task is still incomplete.
    NotReady,
    /// Another observation for this tenant is already transitioning it.
    InFlight,
    /// The store reported the tenant had already left `onboarding`.
    AlreadyTransitioned,
    /// This observation moved the tenant to `reviewing`.
    Transitioned { phase_started_at: DateTime<Utc> },
    /// The store update failed; the next observation will retry.
    Failed { reason: String },
}

impl TransitionOutcome {
    pub fn fired(&self) -> bool {
        matches!(self, Self::Transitioned { .. })
    }
}

/// Per-tenant single-flight set.
#[derive(Debug, Default)]
pub struct TransitionGuards {
    in_flight: Mutex<HashSet<Uuid>>,
}

impl TransitionGuards {
    /// Claim the tenant. `None` if a transition is already outstanding.
    pub fn try_acquire(&self, tenant_id: Uuid) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if set.insert(tenant_id) {
            Some(InFlight {
                guards: self,
                tenant_id,
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, tenant_id: Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&tenant_id)
    }
}

/// Releases the tenant's claim when dropped, whether the attempt succeeded,
/// failed, or the future was dropped mid-flight.
pub struct InFlight<'a> {
    guards: &'a TransitionGuards,
    tenant_id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.guards
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.tenant_id);
    }
}

/// Watches task completion and fires the `onboarding → reviewing` transition.
pub struct PhaseController {
    db: Arc<dyn Database>,
    graph: DependencyGraph,
    guards: TransitionGuards,
}

impl PhaseController {
    pub fn new(db: Arc<dyn Database>, graph: DependencyGraph) -> Self {
        Self {
            db,
            graph,
            guards: TransitionGuards::default(),
        }
    }

    pub fn is_in_flight(&self, tenant_id: Uuid) -> bool {
        self.guards.is_in_flight(tenant_id)
    }

    /// Whether every configured task is complete and the tenant is still onboarding.
    pub fn is_ready<T: Completion>(&self, tenant: &Tenant, tasks: &[T]) -> bool {
        tenant.phase == TenantPhase::Onboarding
            && !self.graph.is_empty()
            && self
                .graph
                .keys()
                .iter()
                .all(|key| tasks.iter().any(|t| t.key() == *key && t.is_completed()))
    }

    /// Evaluate one observation of `tenant` and its tasks.
    ///
    /// Never returns an error: a failed phase update is reported as
    /// [`TransitionOutcome::Failed`] and retried on the next observation.
    pub async fn observe<T: Completion>(&self, tenant: &Tenant, tasks: &[T]) -> TransitionOutcome {
        if !self.is_ready(tenant, tasks) {
            return TransitionOutcome::NotReady;
        }

        let Some(_claim) = self.guards.try_acquire(tenant.id) else {
            debug!(tenant_id = %tenant.id, "Phase transition already in flight, skipping");
            return TransitionOutcome::InFlight;
        };

        let now = Utc::now();
        match self
            .db
            .transition_phase(tenant.id, TenantPhase::Onboarding, TenantPhase::Reviewing, now)
            .await
        {
            Ok(true) => {
                info!(tenant_id = %tenant.id, "All onboarding tasks complete, tenant moved to reviewing");
                TransitionOutcome::Transitioned {
                    phase_started_at: now,
                }
            }
            Ok(false) => {
                debug!(tenant_id = %tenant.id, "Tenant already left onboarding");
                TransitionOutcome::AlreadyTransitioned
            }
            Err(e) => {
                warn!(tenant_id = %tenant.id, error = %e, "Phase transition failed, will retry on next observation");
                TransitionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::DatabaseError;
    use crate::onboarding::graph::TaskKey;
    use crate::onboarding::model::OnboardingTask;
    use crate::store::{MemoryBackend, TaskPatch};

    /// Wraps a backend: counts phase updates, can hold them open, can fail them.
    struct Instrumented {
        inner: MemoryBackend,
        transition_calls: AtomicUsize,
        hold: AtomicBool,
        release: Notify,
        entered: Notify,
        fail: AtomicBool,
    }

    impl Instrumented {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                transition_calls: AtomicUsize::new(0),
                hold: AtomicBool::new(false),
                release: Notify::new(),
                entered: Notify::new(),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Database for Instrumented {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn create_tenant(&self, t: &Tenant, k: &[TaskKey]) -> Result<bool, DatabaseError> {
            self.inner.create_tenant(t, k).await
        }
        async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DatabaseError> {
            self.inner.get_tenant(id).await
        }
        async fn transition_phase(
            &self,
            id: Uuid,
            from: TenantPhase,
            to: TenantPhase,
            at: DateTime<Utc>,
        ) -> Result<bool, DatabaseError> {
            self.transition_calls.fetch_add(1, Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(DatabaseError::Pool("store unavailable".into()));
            }
            self.inner.transition_phase(id, from, to, at).await
        }
        async fn delete_tenant(&self, id: Uuid) -> Result<bool, DatabaseError> {
            self.inner.delete_tenant(id).await
        }
        async fn list_tasks(&self, id: Uuid) -> Result<Vec<OnboardingTask>, DatabaseError> {
            self.inner.list_tasks(id).await
        }
        async fn get_task(
            &self,
            id: Uuid,
            key: TaskKey,
        ) -> Result<Option<OnboardingTask>, DatabaseError> {
            self.inner.get_task(id, key).await
        }
        async fn merge_task_data(
            &self,
            id: Uuid,
            key: TaskKey,
            patch: &TaskPatch,
        ) -> Result<OnboardingTask, DatabaseError> {
            self.inner.merge_task_data(id, key, patch).await
        }
    }

    async fn all_complete(db: &Instrumented) -> (Tenant, Vec<OnboardingTask>) {
        let tenant = Tenant::new(Uuid::new_v4());
        db.create_tenant(&tenant, &TaskKey::ALL).await.unwrap();
        for key in TaskKey::ALL {
            db.merge_task_data(tenant.id, key, &TaskPatch::complete())
                .await
                .unwrap();
        }
        let tasks = db.list_tasks(tenant.id).await.unwrap();
        (tenant, tasks)
    }

    #[tokio::test]
    async fn incomplete_tasks_do_not_transition() {
        let db = Arc::new(Instrumented::new());
        let controller = PhaseController::new(db.clone(), DependencyGraph::default());
        let tenant = Tenant::new(Uuid::new_v4());
        db.create_tenant(&tenant, &TaskKey::ALL).await.unwrap();
        for key in &TaskKey::ALL[..4] {
            db.merge_task_data(tenant.id, *key, &TaskPatch::complete())
                .await
                .unwrap();
        }
        let tasks = db.list_tasks(tenant.id).await.unwrap();

        assert_eq!(controller.observe(&tenant, &tasks).await, TransitionOutcome::NotReady);
        assert_eq!(db.transition_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_observations_fire_once() {
        let db = Arc::new(Instrumented::new());
        let controller = Arc::new(PhaseController::new(db.clone(), DependencyGraph::default()));
        let (tenant, tasks) = all_complete(&db).await;
        db.hold.store(true, Ordering::SeqCst);

        let first = {
            let controller = Arc::clone(&controller);
            let tenant = tenant.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move { controller.observe(&tenant, &tasks).await })
        };
        db.entered.notified().await;
        assert!(controller.is_in_flight(tenant.id));

        let second = controller.observe(&tenant, &tasks).await;
        assert_eq!(second, TransitionOutcome::InFlight);

        db.release.notify_one();
        let first = first.await.unwrap();
        assert!(first.fired());
        assert!(!controller.is_in_flight(tenant.id));
        assert_eq!(db.transition_calls.load(Ordering::SeqCst), 1);

        let stored = db.get_tenant(tenant.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, TenantPhase::Reviewing);
    }

    #[tokio::test]
    async fn stale_observation_after_settle_does_not_refire() {
        let db = Arc::new(Instrumented::new());
        let controller = PhaseController::new(db.clone(), DependencyGraph::default());
        let (tenant, tasks) = all_complete(&db).await;

        assert!(controller.observe(&tenant, &tasks).await.fired());
        let stored = db.get_tenant(tenant.id).await.unwrap().unwrap();

        // `tenant` is the stale snapshot still saying onboarding.
        assert_eq!(
            controller.observe(&tenant, &tasks).await,
            TransitionOutcome::AlreadyTransitioned
        );
        let after = db.get_tenant(tenant.id).await.unwrap().unwrap();
        assert_eq!(after.phase_started_at, stored.phase_started_at);

        // A fresh snapshot is simply not ready.
        assert_eq!(controller.observe(&after, &tasks).await, TransitionOutcome::NotReady);
    }

    #[tokio::test]
    async fn failure_releases_guard_and_retry_succeeds() {
        let db = Arc::new(Instrumented::new());
        let controller = PhaseController::new(db.clone(), DependencyGraph::default());
        let (tenant, tasks) = all_complete(&db).await;

        db.fail.store(true, Ordering::SeqCst);
        let outcome = controller.observe(&tenant, &tasks).await;
        assert!(matches!(outcome, TransitionOutcome::Failed { .. }));
        assert!(!controller.is_in_flight(tenant.id));
        let stored = db.get_tenant(tenant.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, TenantPhase::Onboarding);

        db.fail.store(false, Ordering::SeqCst);
        assert!(controller.observe(&tenant, &tasks).await.fired());
    }

    #[tokio::test]
    async fn guards_are_per_tenant() {
        let guards = TransitionGuards::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let claim_a = guards.try_acquire(a).unwrap();
        assert!(guards.try_acquire(a).is_none());
        assert!(guards.try_acquire(b).is_some());
        drop(claim_a);
        assert!(guards.try_acquire(a).is_some());
    }
}
