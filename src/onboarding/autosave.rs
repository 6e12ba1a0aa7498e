//! Debounced autosave for single-field edits.
//!
//! Edits are collected per (tenant, task) and written as one merge once the
//! edits stop for the debounce window. Every edit restarts the window. Writes
//! for one (tenant, task) never overlap: each takes the slot's write lock
//! before picking up the pending fields, so a later write always carries
//! newer values. A failed background write keeps its fields pending so the
//! next edit or an explicit flush carries them again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::fields::validate_field;
use super::graph::TaskKey;
use super::manager::{OnboardingManager, TaskUpdate};
use super::model::TaskData;
use crate::error::Result;

#[derive(Debug, Default)]
struct Slot {
    data: TaskData,
    /// Bumped on every edit; a timer only writes if it is still current.
    generation: u64,
    /// Timers and flushes still using this slot. The slot is dropped once
    /// this reaches zero with nothing pending.
    active: usize,
    write: Arc<tokio::sync::Mutex<()>>,
}

pub struct Autosaver {
    manager: Arc<OnboardingManager>,
    debounce: Duration,
    slots: Mutex<HashMap<(Uuid, TaskKey), Slot>>,
}

impl Autosaver {
    pub fn new(manager: Arc<OnboardingManager>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            manager,
            debounce,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Queue one field edit and (re)start the debounce window.
    ///
    /// The key and field are validated now; the write happens later.
    pub fn queue(self: &Arc<Self>, tenant_id: Uuid, key: &str, field: &str, value: Value) -> Result<()> {
        let key = self.manager.graph().parse(key)?;
        validate_field(key, field)?;

        let generation = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry((tenant_id, key)).or_default();
            slot.data.insert(field.to_string(), value);
            slot.generation += 1;
            slot.active += 1;
            slot.generation
        };
        debug!(tenant_id = %tenant_id, task = %key, field, "Autosave queued");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            match this.write_pending(tenant_id, key, Some(generation)).await {
                Ok(Some(update)) => {
                    debug!(tenant_id = %tenant_id, task = %key, fields = update.task.data.len(), "Autosave written")
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(tenant_id = %tenant_id, task = %key, error = %e, "Autosave failed")
                }
            }
            this.release(tenant_id, key);
        });
        Ok(())
    }

    /// Write whatever is pending for the task right now.
    ///
    /// Waits for a write already in flight for the same task, then sends
    /// what is left. `Ok(None)` when nothing was pending. On failure the
    /// fields stay pending and the error is returned, unless the tenant no
    /// longer exists, in which case they are dropped.
    pub async fn flush(&self, tenant_id: Uuid, key: TaskKey) -> Result<Option<TaskUpdate>> {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(&(tenant_id, key)) {
                Some(slot) => slot.active += 1,
                None => return Ok(None),
            }
        }
        let result = self.write_pending(tenant_id, key, None).await;
        self.release(tenant_id, key);
        result
    }

    /// Drop every pending edit for a tenant, e.g. after it was deleted.
    pub fn discard_tenant(&self, tenant_id: Uuid) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|(tenant, _), slot| {
            if *tenant != tenant_id {
                return true;
            }
            slot.data.clear();
            slot.active > 0
        });
    }

    /// Field names waiting to be written for the task.
    pub fn pending_fields(&self, tenant_id: Uuid, key: TaskKey) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&(tenant_id, key))
            .map(|s| s.data.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Take the write lock, then write the pending fields.
    ///
    /// With `generation`, only writes if no newer edit arrived meanwhile;
    /// that edit's own timer will pick the fields up.
    async fn write_pending(
        &self,
        tenant_id: Uuid,
        key: TaskKey,
        generation: Option<u64>,
    ) -> Result<Option<TaskUpdate>> {
        let write = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get(&(tenant_id, key)) {
                Some(slot) => Arc::clone(&slot.write),
                None => return Ok(None),
            }
        };
        let _writing = write.lock().await;

        let Some(data) = self.take(tenant_id, key, generation) else {
            return Ok(None);
        };
        match self
            .manager
            .update_task(tenant_id, key.as_str(), data.clone(), false)
            .await
        {
            Ok(update) => Ok(Some(update)),
            Err(e) if e.is_not_found() => {
                debug!(tenant_id = %tenant_id, task = %key, "Tenant gone, dropping autosave");
                Err(e)
            }
            Err(e) => {
                self.restore(tenant_id, key, data);
                Err(e)
            }
        }
    }

    fn take(&self, tenant_id: Uuid, key: TaskKey, generation: Option<u64>) -> Option<TaskData> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get_mut(&(tenant_id, key))?;
        if generation.is_some_and(|g| g != slot.generation) || slot.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut slot.data))
    }

    /// Put failed fields back. Edits made since the write started win.
    fn restore(&self, tenant_id: Uuid, key: TaskKey, data: TaskData) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Missing when the tenant was discarded while the write was in flight.
        if let Some(slot) = slots.get_mut(&(tenant_id, key)) {
            for (field, value) in data {
                slot.data.entry(field).or_insert(value);
            }
        }
    }

    fn release(&self, tenant_id: Uuid, key: TaskKey) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot_key = (tenant_id, key);
        let Some(slot) = slots.get_mut(&slot_key) else {
            return;
        };
        slot.active = slot.active.saturating_sub(1);
        if slot.active == 0 && slot.data.is_empty() {
            slots.remove(&slot_key);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    use super::*;
    use crate::config::StepTimings;
    use crate::error::{DatabaseError, Error, ValidationError};
    use crate::onboarding::graph::DependencyGraph;
    use crate::onboarding::model::{OnboardingTask, Tenant, TenantPhase};
    use crate::store::{BlobStore, Database, LocalBlobStore, MemoryBackend, TaskPatch};

    const DEBOUNCE: Duration = Duration::from_millis(800);

    /// Wraps a backend: can make the first merge slow, can fail merges.
    struct Controlled {
        inner: MemoryBackend,
        slow_first_merge: AtomicBool,
        fail_merges: AtomicBool,
    }

    #[async_trait]
    impl Database for Controlled {
        async fn run_migrations(&self) -> std::result::Result<(), DatabaseError> {
            Ok(())
        }
        async fn create_tenant(
            &self,
            t: &Tenant,
            k: &[TaskKey],
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.create_tenant(t, k).await
        }
        async fn get_tenant(&self, id: Uuid) -> std::result::Result<Option<Tenant>, DatabaseError> {
            self.inner.get_tenant(id).await
        }
        async fn transition_phase(
            &self,
            id: Uuid,
            from: TenantPhase,
            to: TenantPhase,
            at: DateTime<Utc>,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.transition_phase(id, from, to, at).await
        }
        async fn delete_tenant(&self, id: Uuid) -> std::result::Result<bool, DatabaseError> {
            self.inner.delete_tenant(id).await
        }
        async fn list_tasks(
            &self,
            id: Uuid,
        ) -> std::result::Result<Vec<OnboardingTask>, DatabaseError> {
            self.inner.list_tasks(id).await
        }
        async fn get_task(
            &self,
            id: Uuid,
            key: TaskKey,
        ) -> std::result::Result<Option<OnboardingTask>, DatabaseError> {
            self.inner.get_task(id, key).await
        }
        async fn merge_task_data(
            &self,
            id: Uuid,
            key: TaskKey,
            patch: &TaskPatch,
        ) -> std::result::Result<OnboardingTask, DatabaseError> {
            if self.slow_first_merge.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            if self.fail_merges.load(Ordering::SeqCst) {
                return Err(DatabaseError::Pool("store unavailable".into()));
            }
            self.inner.merge_task_data(id, key, patch).await
        }
    }

    async fn setup() -> (Arc<OnboardingManager>, Arc<Autosaver>, Arc<Controlled>, Uuid) {
        let db = Arc::new(Controlled {
            inner: MemoryBackend::new(),
            slow_first_merge: AtomicBool::new(false),
            fail_merges: AtomicBool::new(false),
        });
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(std::env::temp_dir()));
        let manager = Arc::new(OnboardingManager::new(
            db.clone(),
            blobs,
            DependencyGraph::default(),
            StepTimings::default(),
        ));
        let id = Uuid::new_v4();
        manager.provision_tenant(id).await.unwrap();
        let saver = Autosaver::new(Arc::clone(&manager), DEBOUNCE);
        (manager, saver, db, id)
    }

    async fn brand_data(manager: &OnboardingManager, id: Uuid) -> TaskData {
        let view = manager.get_tasks(id).await.unwrap();
        view.task(TaskKey::Brand).unwrap().data.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn edits_coalesce_into_one_write() {
        let (manager, saver, _db, id) = setup().await;
        saver.queue(id, "brand", "tagline", json!("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        saver.queue(id, "brand", "primary_color", json!("#fff")).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // First window was restarted by the second edit.
        assert!(brand_data(&manager, id).await.is_empty());
        assert_eq!(saver.pending_fields(id, TaskKey::Brand).len(), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let data = brand_data(&manager, id).await;
        assert_eq!(data["tagline"], "a");
        assert_eq!(data["primary_color"], "#fff");
        assert!(saver.pending_fields(id, TaskKey::Brand).is_empty());
        assert_eq!(saver.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn later_edit_of_same_field_wins() {
        let (manager, saver, _db, id) = setup().await;
        saver.queue(id, "brand", "tagline", json!("first")).unwrap();
        saver.queue(id, "brand", "tagline", json!("second")).unwrap();
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(brand_data(&manager, id).await["tagline"], "second");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_is_not_overtaken_by_a_newer_edit() {
        let (manager, saver, db, id) = setup().await;
        db.slow_first_merge.store(true, Ordering::SeqCst);

        saver.queue(id, "brand", "tagline", json!("old")).unwrap();
        // The "old" write starts at 800ms and takes 2s.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        saver.queue(id, "brand", "tagline", json!("new")).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(brand_data(&manager, id).await["tagline"], "new");
        assert_eq!(saver.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_write_in_flight() {
        let (manager, saver, db, id) = setup().await;
        db.slow_first_merge.store(true, Ordering::SeqCst);

        saver.queue(id, "brand", "tagline", json!("old")).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        saver.queue(id, "brand", "tagline", json!("new")).unwrap();

        let update = saver.flush(id, TaskKey::Brand).await.unwrap().unwrap();
        assert_eq!(update.task.data["tagline"], "new");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(brand_data(&manager, id).await["tagline"], "new");
    }

    #[tokio::test]
    async fn invalid_edits_are_rejected_immediately() {
        let (_manager, saver, _db, id) = setup().await;
        let err = saver.queue(id, "brand", "signer_name", json!("x")).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::UnknownField { .. })));
        let err = saver.queue(id, "payroll", "x", json!(1)).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::UnknownTask(_))));
        assert!(saver.pending_fields(id, TaskKey::Brand).is_empty());
        assert_eq!(saver.tracked(), 0);
    }

    #[tokio::test]
    async fn explicit_flush_writes_immediately() {
        let (manager, saver, _db, id) = setup().await;
        assert!(saver.flush(id, TaskKey::Brand).await.unwrap().is_none());

        saver.queue(id, "brand", "tagline", json!("now")).unwrap();
        let update = saver.flush(id, TaskKey::Brand).await.unwrap().unwrap();
        assert_eq!(update.task.data["tagline"], "now");
        assert_eq!(brand_data(&manager, id).await["tagline"], "now");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_fields_pending() {
        let (manager, saver, db, id) = setup().await;
        db.fail_merges.store(true, Ordering::SeqCst);

        saver.queue(id, "brand", "tagline", json!("kept")).unwrap();
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(saver.pending_fields(id, TaskKey::Brand), ["tagline"]);

        let err = saver.flush(id, TaskKey::Brand).await.unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::Pool(_))));
        assert_eq!(saver.pending_fields(id, TaskKey::Brand), ["tagline"]);

        db.fail_merges.store(false, Ordering::SeqCst);
        saver.flush(id, TaskKey::Brand).await.unwrap();
        assert_eq!(brand_data(&manager, id).await["tagline"], "kept");
        assert_eq!(saver.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_for_deleted_tenant_are_dropped() {
        let (manager, saver, _db, id) = setup().await;
        manager.delete_tenant(id).await.unwrap();

        saver.queue(id, "brand", "tagline", json!("gone")).unwrap();
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(saver.pending_fields(id, TaskKey::Brand).is_empty());
        assert_eq!(saver.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_tenant_drops_pending_edits() {
        let (manager, saver, _db, id) = setup().await;
        saver.queue(id, "brand", "tagline", json!("draft")).unwrap();
        saver.queue(id, "venue", "rooms", json!(12)).unwrap();

        saver.discard_tenant(id);
        assert!(saver.pending_fields(id, TaskKey::Brand).is_empty());

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(brand_data(&manager, id).await.is_empty());
        assert_eq!(saver.tracked(), 0);
    }
}
