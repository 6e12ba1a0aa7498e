//! Tenant onboarding — ordered setup tasks, progress, and the hand-off to review.
//!
//! A tenant works through a fixed list of tasks, each unlocked by completing
//! the one before it. Task data is shallow-merged into a per-task JSON
//! document; once every task is complete the tenant moves to `reviewing`.

pub mod autosave;
pub mod fields;
pub mod graph;
pub mod manager;
pub mod model;
pub mod phase;
pub mod progression;
pub mod routes;
pub mod sequencer;

pub use autosave::Autosaver;
pub use graph::{Completion, DependencyGraph, TaskKey};
pub use manager::{OnboardingManager, TaskUpdate, Upload};
pub use model::{
    FileAttachment, OnboardingEvent, OnboardingTask, OnboardingView, TaskData, TaskView, Tenant,
    TenantPhase, TenantStatus,
};
pub use phase::{PhaseController, TransitionOutcome};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use sequencer::{SequencerState, StepPhase, StepSequencer};
