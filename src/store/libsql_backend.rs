//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every task merge runs in an
//! `IMMEDIATE` transaction; a reader/writer gate keeps readers on the shared
//! connection from observing a transaction that has not committed yet.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::graph::TaskKey;
use crate::onboarding::model::{OnboardingTask, TaskData, Tenant, TenantPhase};
use crate::store::migrations;
use crate::store::patch::TaskPatch;
use crate::store::traits::{Database, tenant_not_found};

const TASK_COLUMNS: &str = "tenant_id, task_key, is_completed, completed_at, data, updated_at";
const TENANT_COLUMNS: &str = "id, phase, phase_started_at, created_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Readers share, transactions take it exclusively.
    gate: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `body` inside an `IMMEDIATE` transaction, committing on success and
    /// rolling back on any error.
    async fn in_transaction<T, F, Fut>(&self, op: &str, body: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: std::future::Future<Output = Result<T, DatabaseError>>,
    {
        let _exclusive = self.gate.write().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Conflict(format!("{op}: begin: {e}")))?;

        match body(self.conn().clone()).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Conflict(format!("{op}: commit: {e}")))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(op, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn row_to_tenant(row: &libsql::Row) -> Result<Tenant, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("tenant id: {e}")))?;
    let phase: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("tenant phase: {e}")))?;
    let phase_started_at: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("tenant phase_started_at: {e}")))?;
    let created_at: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("tenant created_at: {e}")))?;

    Ok(Tenant {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        phase: phase.parse().map_err(DatabaseError::Serialization)?,
        phase_started_at: parse_datetime(&phase_started_at),
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<OnboardingTask, DatabaseError> {
    let tenant_id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task tenant_id: {e}")))?;
    let task_key: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task key: {e}")))?;
    let is_completed: i64 = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("task is_completed: {e}")))?;
    let completed_at: Option<String> = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("task completed_at: {e}")))?;
    let data_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("task data: {e}")))?;
    let updated_at: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("task updated_at: {e}")))?;

    let data: TaskData = serde_json::from_str(&data_str)
        .map_err(|e| DatabaseError::Serialization(format!("task data: {e}")))?;

    Ok(OnboardingTask {
        tenant_id: Uuid::parse_str(&tenant_id)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        task_key: task_key
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("{e}")))?,
        is_completed: is_completed != 0,
        completed_at: completed_at.as_deref().map(parse_datetime),
        data,
        updated_at: parse_datetime(&updated_at),
    })
}

async fn fetch_tenant(conn: &Connection, id: Uuid) -> Result<Option<Tenant>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_tenant: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_tenant(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_tenant: {e}"))),
    }
}

async fn fetch_task(
    conn: &Connection,
    tenant_id: Uuid,
    key: TaskKey,
) -> Result<Option<OnboardingTask>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {TASK_COLUMNS} FROM onboarding_tasks WHERE tenant_id = ?1 AND task_key = ?2"
            ),
            params![tenant_id.to_string(), key.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
    }
}

async fn upsert_task(conn: &Connection, task: &OnboardingTask) -> Result<(), DatabaseError> {
    let data = serde_json::to_string(&task.data)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO onboarding_tasks (tenant_id, task_key, is_completed, completed_at, data, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (tenant_id, task_key) DO UPDATE SET
            is_completed = ?3, completed_at = ?4, data = ?5, updated_at = ?6",
        params![
            task.tenant_id.to_string(),
            task.task_key.as_str(),
            task.is_completed as i64,
            opt_text(task.completed_at.map(|t| t.to_rfc3339())),
            data,
            task.updated_at.to_rfc3339()
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("upsert_task: {e}")))?;
    Ok(())
}

// ── Database impl ───────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _exclusive = self.gate.write().await;
        migrations::run_migrations(self.conn()).await
    }

    async fn create_tenant(
        &self,
        tenant: &Tenant,
        keys: &[TaskKey],
    ) -> Result<bool, DatabaseError> {
        let tenant = tenant.clone();
        let keys = keys.to_vec();
        self.in_transaction("create_tenant", |conn| async move {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO tenants (id, phase, phase_started_at, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        tenant.id.to_string(),
                        tenant.phase.as_str(),
                        tenant.phase_started_at.to_rfc3339(),
                        tenant.created_at.to_rfc3339()
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("create_tenant: {e}")))?;

            if inserted == 0 {
                return Ok(false);
            }

            for key in keys {
                upsert_task(&conn, &OnboardingTask::empty(tenant.id, key)).await?;
            }
            Ok(true)
        })
        .await
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, DatabaseError> {
        let _shared = self.gate.read().await;
        fetch_tenant(self.conn(), id).await
    }

    async fn transition_phase(
        &self,
        id: Uuid,
        from: TenantPhase,
        to: TenantPhase,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _exclusive = self.gate.write().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE tenants SET phase = ?1, phase_started_at = ?2 WHERE id = ?3 AND phase = ?4",
                params![to.as_str(), at.to_rfc3339(), id.to_string(), from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_phase: {e}")))?;
        debug!(tenant_id = %id, %from, %to, changed, "Phase update executed");
        Ok(changed > 0)
    }

    async fn delete_tenant(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.in_transaction("delete_tenant", |conn| async move {
            conn.execute(
                "DELETE FROM onboarding_tasks WHERE tenant_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_tenant tasks: {e}")))?;
            let count = conn
                .execute("DELETE FROM tenants WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_tenant: {e}")))?;
            Ok(count > 0)
        })
        .await
    }

    async fn list_tasks(&self, tenant_id: Uuid) -> Result<Vec<OnboardingTask>, DatabaseError> {
        let _shared = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM onboarding_tasks WHERE tenant_id = ?1"),
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn get_task(
        &self,
        tenant_id: Uuid,
        key: TaskKey,
    ) -> Result<Option<OnboardingTask>, DatabaseError> {
        let _shared = self.gate.read().await;
        fetch_task(self.conn(), tenant_id, key).await
    }

    async fn merge_task_data(
        &self,
        tenant_id: Uuid,
        key: TaskKey,
        patch: &TaskPatch,
    ) -> Result<OnboardingTask, DatabaseError> {
        let patch = patch.clone();
        self.in_transaction("merge_task_data", |conn| async move {
            if fetch_tenant(&conn, tenant_id).await?.is_none() {
                return Err(tenant_not_found(tenant_id));
            }

            let mut task = fetch_task(&conn, tenant_id, key)
                .await?
                .unwrap_or_else(|| OnboardingTask::empty(tenant_id, key));
            patch.apply(&mut task, Utc::now());
            upsert_task(&conn, &task).await?;

            debug!(
                tenant_id = %tenant_id,
                task = %key,
                merged = patch.merge.len(),
                removed = patch.remove.len(),
                completed = task.is_completed,
                "Task document merged"
            );
            Ok(task)
        })
        .await
    }
}

// ── Tests ───────────────────────────────────────────────────────────
