//! OnboardingManager — the caller-facing API.
//!
//! Validates at the boundary, routes every document mutation through
//! `Database::merge_task_data`, rebuilds the task view, lets the phase
//! controller observe the result, and broadcasts what changed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::fields::{validate_field, validate_update};
use super::graph::{DependencyGraph, TaskKey};
use super::model::{
    FileAttachment, OnboardingEvent, OnboardingView, TaskData, TaskView, Tenant, TenantPhase,
};
use super::phase::{PhaseController, TransitionOutcome};
use super::progression::build_view;
use super::sequencer::StepSequencer;
use crate::config::StepTimings;
use crate::error::{DatabaseError, Error, Result, ValidationError};
use crate::store::blob::sanitize_file_name;
use crate::store::{BlobStore, Database, TaskPatch};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// A file handed in by the presentation layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Result of a committed task mutation.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    /// The task as committed.
    pub task: TaskView,
    /// The tenant's full view after the commit.
    pub view: OnboardingView,
    /// What the phase controller did with this observation.
    pub transition: TransitionOutcome,
}

pub struct OnboardingManager {
    db: Arc<dyn Database>,
    blobs: Arc<dyn BlobStore>,
    graph: DependencyGraph,
    phase: PhaseController,
    timings: StepTimings,
    sequencers: Mutex<HashMap<Uuid, Arc<StepSequencer>>>,
    events: broadcast::Sender<OnboardingEvent>,
}

impl OnboardingManager {
    pub fn new(
        db: Arc<dyn Database>,
        blobs: Arc<dyn BlobStore>,
        graph: DependencyGraph,
        timings: StepTimings,
    ) -> Self {
        let (events, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            phase: PhaseController::new(Arc::clone(&db), graph.clone()),
            db,
            blobs,
            graph,
            timings,
            sequencers: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Subscribe to events for every tenant.
    pub fn subscribe(&self) -> broadcast::Receiver<OnboardingEvent> {
        self.events.subscribe()
    }

    // ── Tenants ─────────────────────────────────────────────────────

    /// Create a tenant with one empty task per configured key.
    ///
    /// Provisioning an existing tenant changes nothing and returns its view.
    pub async fn provision_tenant(&self, id: Uuid) -> Result<OnboardingView> {
        let created = self
            .db
            .create_tenant(&Tenant::new(id), self.graph.keys())
            .await?;
        if created {
            info!(tenant_id = %id, tasks = self.graph.len(), "Tenant provisioned");
        } else {
            debug!(tenant_id = %id, "Tenant already provisioned");
        }
        self.get_tasks(id).await
    }

    pub async fn get_tenant(&self, id: Uuid) -> Result<Tenant> {
        self.db.get_tenant(id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound {
                entity: "tenant".to_string(),
                id: id.to_string(),
            })
        })
    }

    pub async fn delete_tenant(&self, id: Uuid) -> Result<bool> {
        let deleted = self.db.delete_tenant(id).await?;
        self.sequencers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if deleted {
            info!(tenant_id = %id, "Tenant deleted");
        }
        Ok(deleted)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// The ordered task view. Also lets the phase controller observe the
    /// current state, so a transition that failed earlier is retried here.
    pub async fn get_tasks(&self, id: Uuid) -> Result<OnboardingView> {
        let mut tenant = self.get_tenant(id).await?;
        let tasks = self.db.list_tasks(id).await?;
        let outcome = self.phase.observe(&tenant, &tasks).await;
        self.settle_transition(&mut tenant, &outcome);
        Ok(build_view(&self.graph, &tenant, &tasks))
    }

    /// Shallow-merge `data` into the task, optionally marking it complete.
    pub async fn update_task(
        &self,
        id: Uuid,
        key: &str,
        data: TaskData,
        mark_completed: bool,
    ) -> Result<TaskUpdate> {
        let key = self.graph.parse(key)?;
        validate_update(key, &data, &[])?;
        self.apply(id, key, TaskPatch::merge(data).with_completed(mark_completed))
            .await
    }

    /// Merge `merge` and delete `remove` in one atomic step. Removal wins.
    pub async fn remove_task_fields(
        &self,
        id: Uuid,
        key: &str,
        merge: TaskData,
        remove: Vec<String>,
    ) -> Result<TaskUpdate> {
        let key = self.graph.parse(key)?;
        validate_update(key, &merge, &remove)?;
        self.apply(id, key, TaskPatch::merge(merge).with_remove(remove))
            .await
    }

    /// Upload a file and record a reference to it under `field`.
    ///
    /// The document is only touched after the upload succeeded; a failed
    /// upload leaves it unchanged.
    pub async fn upload_and_attach(
        &self,
        id: Uuid,
        key: &str,
        field: &str,
        upload: Upload,
    ) -> Result<TaskUpdate> {
        let key = self.graph.parse(key)?;
        validate_field(key, field)?;
        if upload.bytes.is_empty() {
            return Err(ValidationError::EmptyUpload {
                field: field.to_string(),
            }
            .into());
        }
        let file_name = sanitize_file_name(&upload.file_name)
            .ok_or_else(|| ValidationError::InvalidFileName(upload.file_name.clone()))?;

        self.get_tenant(id).await?;

        let path = format!("{id}/{key}/{}-{file_name}", Uuid::new_v4().simple());
        let blob = self.blobs.upload(&path, &upload.bytes).await?;

        let attachment = FileAttachment {
            path: blob.path,
            file_name,
            content_type: upload.content_type,
            size: blob.size,
            uploaded_at: Utc::now(),
        };
        let value = serde_json::to_value(&attachment)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let mut merge = TaskData::new();
        merge.insert(field.to_string(), value);
        info!(tenant_id = %id, task = %key, field, size = attachment.size, "File attached");
        self.apply(id, key, TaskPatch::merge(merge)).await
    }

    /// Drive the step sequencer for a task the presentation layer just completed.
    pub async fn on_step_complete(&self, id: Uuid, key: &str) -> Result<()> {
        let key = self.graph.parse(key)?;
        let view = self.get_tasks(id).await?;
        self.sequencer(id).step_complete(key, view.tasks);
        Ok(())
    }

    /// The tenant's step sequencer, created on first use.
    ///
    /// Its state changes are forwarded as [`OnboardingEvent::StepState`].
    pub fn sequencer(&self, id: Uuid) -> Arc<StepSequencer> {
        let mut sequencers = self.sequencers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(seq) = sequencers.get(&id) {
            return Arc::clone(seq);
        }

        let seq = StepSequencer::new(self.graph.clone(), self.timings);
        let mut rx = seq.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let _ = events.send(OnboardingEvent::StepState {
                    tenant_id: id,
                    state,
                });
            }
        });

        sequencers.insert(id, Arc::clone(&seq));
        seq
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn apply(&self, id: Uuid, key: TaskKey, patch: TaskPatch) -> Result<TaskUpdate> {
        let mut tenant = self.get_tenant(id).await?;

        let committed = self.db.merge_task_data(id, key, &patch).await?;
        debug!(
            tenant_id = %id,
            task = %key,
            fields = committed.data.len(),
            completed = committed.is_completed,
            "Task data merged"
        );
        if patch.mark_completed {
            info!(tenant_id = %id, task = %key, "Task marked complete");
        }

        let tasks = self.db.list_tasks(id).await?;
        let transition = self.phase.observe(&tenant, &tasks).await;
        self.settle_transition(&mut tenant, &transition);

        let view = build_view(&self.graph, &tenant, &tasks);
        let task = view
            .task(key)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownTask(key.to_string()))?;

        let _ = self.events.send(OnboardingEvent::TaskUpdated {
            tenant_id: id,
            task: task.clone(),
            progress: view.progress,
        });

        Ok(TaskUpdate {
            task,
            view,
            transition,
        })
    }

    /// Reflect a fired transition in the local tenant copy and announce it.
    fn settle_transition(&self, tenant: &mut Tenant, outcome: &TransitionOutcome) {
        if let TransitionOutcome::Transitioned { phase_started_at } = outcome {
            tenant.phase = TenantPhase::Reviewing;
            tenant.phase_started_at = *phase_started_at;
            let _ = self.events.send(OnboardingEvent::PhaseChanged {
                tenant_id: tenant.id,
                phase: tenant.phase,
                phase_started_at: *phase_started_at,
            });
        }
    }
}
