//! In-process `Database` backend.
//!
//! Each `(tenant, task)` document sits behind its own async mutex, so merges
//! on the same key serialize while merges on different keys run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::graph::TaskKey;
use crate::onboarding::model::{OnboardingTask, Tenant, TenantPhase};
use crate::store::patch::TaskPatch;
use crate::store::traits::{Database, tenant_not_found};

type TaskSlot = Arc<Mutex<OnboardingTask>>;

/// Volatile backend for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryBackend {
    tenants: RwLock<HashMap<Uuid, Tenant>>,
    tasks: RwLock<HashMap<(Uuid, TaskKey), TaskSlot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for a key, creating an empty document if none exists.
    async fn slot(&self, tenant_id: Uuid, key: TaskKey) -> TaskSlot {
        if let Some(slot) = self.tasks.read().await.get(&(tenant_id, key)) {
            return Arc::clone(slot);
        }
        let mut tasks = self.tasks.write().await;
        Arc::clone(
            tasks
                .entry((tenant_id, key))
                .or_insert_with(|| Arc::new(Mutex::new(OnboardingTask::empty(tenant_id, key)))),
        )
    }
}

#[async_trait]
impl Database for MemoryBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn create_tenant(
        &self,
        tenant: &Tenant,
        keys: &[TaskKey],
    ) -> Result<bool, DatabaseError> {
        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(&tenant.id) {
            return Ok(false);
        }
        let mut tasks = self.tasks.write().await;
        for key in keys {
            tasks.insert(
                (tenant.id, *key),
                Arc::new(Mutex::new(OnboardingTask::empty(tenant.id, *key))),
            );
        }
        tenants.insert(tenant.id, tenant.clone());
        Ok(true)
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DatabaseError> {
        Ok(self.tenants.read().await.get(&id).cloned())
    }

    async fn transition_phase(
        &self,
        id: Uuid,
        from: TenantPhase,
        to: TenantPhase,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut tenants = self.tenants.write().await;
        match tenants.get_mut(&id) {
            Some(tenant) if tenant.phase == from => {
                tenant.phase = to;
                tenant.phase_started_at = at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(tenant_not_found(id)),
        }
    }

    async fn delete_tenant(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut tenants = self.tenants.write().await;
        let mut tasks = self.tasks.write().await;
        tasks.retain(|(tenant_id, _), _| *tenant_id != id);
        Ok(tenants.remove(&id).is_some())
    }

    async fn list_tasks(&self, tenant_id: Uuid) -> Result<Vec<OnboardingTask>, DatabaseError> {
        let slots: Vec<TaskSlot> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|((id, _), _)| *id == tenant_id)
            .map(|(_, slot)| Arc::clone(slot))
            .collect();

        let mut tasks = Vec::with_capacity(slots.len());
        for slot in slots {
            tasks.push(slot.lock().await.clone());
        }
        tasks.sort_by_key(|t| t.task_key);
        Ok(tasks)
    }

    async fn get_task(
        &self,
        tenant_id: Uuid,
        key: TaskKey,
    ) -> Result<Option<OnboardingTask>, DatabaseError> {
        let slot = self.tasks.read().await.get(&(tenant_id, key)).cloned();
        match slot {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn merge_task_data(
        &self,
        tenant_id: Uuid,
        key: TaskKey,
        patch: &TaskPatch,
    ) -> Result<OnboardingTask, DatabaseError> {
        // Held until the merge is done so a concurrent delete cannot slip in
        // between the check and the write.
        let tenants = self.tenants.read().await;
        if !tenants.contains_key(&tenant_id) {
            return Err(tenant_not_found(tenant_id));
        }

        let slot = self.slot(tenant_id, key).await;
        let mut current = slot.lock().await;
        let mut next = current.clone();
        patch.apply(&mut next, Utc::now());
        *current = next.clone();
        Ok(next)
    }
}
