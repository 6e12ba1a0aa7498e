//! Onboarding engine — tenant setup tasks, progress, and phase hand-off.

pub mod config;
pub mod error;
pub mod onboarding;
pub mod store;
