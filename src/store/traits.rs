//! `Database` trait — the tenant store and the task document store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::graph::TaskKey;
use crate::onboarding::model::{OnboardingTask, Tenant, TenantPhase};

use super::patch::TaskPatch;

/// Backend-agnostic persistence for tenants and their task documents.
///
/// `merge_task_data` is the only way to mutate a task document. Backends must
/// run it as one serializable read-modify-write per `(tenant, task)`: two
/// concurrent calls on the same key behave as if applied one after the other,
/// and a failed call leaves the stored row untouched.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tenants ─────────────────────────────────────────────────────

    /// Insert a tenant and one empty task per key.
    ///
    /// Returns `false` (and writes nothing) if the tenant already exists.
    async fn create_tenant(&self, tenant: &Tenant, keys: &[TaskKey])
    -> Result<bool, DatabaseError>;

    /// Get a tenant by ID.
    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DatabaseError>;

    /// Move a tenant from `from` to `to`, stamping `phase_started_at`.
    ///
    /// Compare-and-set: returns `false` if the tenant is no longer in `from`.
    async fn transition_phase(
        &self,
        id: Uuid,
        from: TenantPhase,
        to: TenantPhase,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Delete a tenant and all of its tasks. Returns `false` if it did not exist.
    async fn delete_tenant(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// All task rows of a tenant, in no particular order.
    async fn list_tasks(&self, tenant_id: Uuid) -> Result<Vec<OnboardingTask>, DatabaseError>;

    /// One task row, if it exists.
    async fn get_task(
        &self,
        tenant_id: Uuid,
        key: TaskKey,
    ) -> Result<Option<OnboardingTask>, DatabaseError>;

    /// Atomically apply `patch` to the task document and return the new row.
    ///
    /// A missing row is treated as an empty, incomplete document. The tenant
    /// itself must exist.
    async fn merge_task_data(
        &self,
        tenant_id: Uuid,
        key: TaskKey,
        patch: &TaskPatch,
    ) -> Result<OnboardingTask, DatabaseError>;
}

pub(crate) fn tenant_not_found(id: Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "tenant".to_string(),
        id: id.to_string(),
    }
}
