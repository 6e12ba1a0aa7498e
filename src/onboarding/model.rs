//! Tenant, task, and view models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::graph::{Completion, TaskKey};
use super::sequencer::SequencerState;

/// Free-form per-task document: top-level string keys to JSON values.
pub type TaskData = serde_json::Map<String, serde_json::Value>;

/// Coarse lifecycle stage of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantPhase {
    Onboarding,
    Reviewing,
    PilotLive,
    Contracted,
}

impl TenantPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Onboarding => "onboarding",
            Self::Reviewing => "reviewing",
            Self::PilotLive => "pilot_live",
            Self::Contracted => "contracted",
        }
    }

    /// Status shown to the property: both live phases collapse to `Live`.
    pub fn status(&self) -> TenantStatus {
        match self {
            Self::Onboarding => TenantStatus::Onboarding,
            Self::Reviewing => TenantStatus::Reviewing,
            Self::PilotLive | Self::Contracted => TenantStatus::Live,
        }
    }
}

impl Default for TenantPhase {
    fn default() -> Self {
        Self::Onboarding
    }
}

impl std::fmt::Display for TenantPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TenantPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onboarding" => Ok(Self::Onboarding),
            "reviewing" => Ok(Self::Reviewing),
            "pilot_live" => Ok(Self::PilotLive),
            "contracted" => Ok(Self::Contracted),
            other => Err(format!("unknown tenant phase: {other}")),
        }
    }
}

/// Coarse status derived from [`TenantPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Onboarding,
    Reviewing,
    Live,
}

/// One property going through onboarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub phase: TenantPhase,
    pub phase_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// A freshly provisioned tenant in the onboarding phase.
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            phase: TenantPhase::Onboarding,
            phase_started_at: now,
            created_at: now,
        }
    }
}

/// One task row for a tenant.
///
/// `is_completed` implies `completed_at.is_some()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingTask {
    pub tenant_id: Uuid,
    pub task_key: TaskKey,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: TaskData,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingTask {
    /// An empty, incomplete task.
    pub fn empty(tenant_id: Uuid, task_key: TaskKey) -> Self {
        Self {
            tenant_id,
            task_key,
            is_completed: false,
            completed_at: None,
            data: TaskData::new(),
            updated_at: Utc::now(),
        }
    }
}

impl Completion for OnboardingTask {
    fn key(&self) -> TaskKey {
        self.task_key
    }

    fn is_completed(&self) -> bool {
        self.is_completed
    }
}

/// One entry in the ordered task list handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub key: TaskKey,
    pub name: String,
    pub is_completed: bool,
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub data: TaskData,
}

impl Completion for TaskView {
    fn key(&self) -> TaskKey {
        self.key
    }

    fn is_completed(&self) -> bool {
        self.is_completed
    }
}

/// Full onboarding state of one tenant, recomputed on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingView {
    pub tenant_id: Uuid,
    pub phase: TenantPhase,
    pub phase_started_at: DateTime<Utc>,
    pub status: TenantStatus,
    /// Percentage of completed tasks, 0–100.
    pub progress: u8,
    pub tasks: Vec<TaskView>,
    /// First incomplete, unlocked task: the one to expand on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task: Option<TaskKey>,
}

impl OnboardingView {
    pub fn task(&self, key: TaskKey) -> Option<&TaskView> {
        self.tasks.iter().find(|t| t.key == key)
    }

    pub fn all_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.is_completed)
    }
}

/// Events broadcast to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnboardingEvent {
    /// Full state (sent on connect and after lag).
    OnboardingSync { view: OnboardingView },
    /// A task document was committed.
    TaskUpdated { tenant_id: Uuid, task: TaskView, progress: u8 },
    /// The tenant moved to a new phase.
    PhaseChanged {
        tenant_id: Uuid,
        phase: TenantPhase,
        phase_started_at: DateTime<Utc>,
    },
    /// The step sequencer moved.
    StepState { tenant_id: Uuid, state: SequencerState },
}

impl OnboardingEvent {
    pub fn tenant_id(&self) -> Uuid {
        match self {
            Self::OnboardingSync { view } => view.tenant_id,
            Self::TaskUpdated { tenant_id, .. }
            | Self::PhaseChanged { tenant_id, .. }
            | Self::StepState { tenant_id, .. } => *tenant_id,
        }
    }
}

/// Reference to a stored blob, recorded into a task document after upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}
