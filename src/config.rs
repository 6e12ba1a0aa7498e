//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Delays between the presentation steps of the step sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimings {
    /// Time spent showing the "just completed" marker before collapsing.
    pub completing: Duration,
    /// Time with every panel collapsed before the next one opens.
    pub collapsing: Duration,
    /// Time the "unlocking" marker stays visible on the newly opened panel.
    pub activating: Duration,
}

impl Default for StepTimings {
    fn default() -> Self {
        Self {
            completing: Duration::from_millis(600),
            collapsing: Duration::from_millis(400),
            activating: Duration::from_millis(900),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port for the REST/WebSocket server.
    pub port: u16,
    /// Root directory of the local blob store.
    pub blob_dir: PathBuf,
    /// Quiet period before queued autosave edits are written.
    pub autosave_debounce: Duration,
    /// Step sequencer delays.
    pub step_timings: StepTimings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/onboarding.db"),
            port: 8080,
            blob_dir: PathBuf::from("./data/blobs"),
            autosave_debounce: Duration::from_millis(800),
            step_timings: StepTimings::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config from `ONBOARDING_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("ONBOARDING_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let blob_dir = lookup("ONBOARDING_BLOB_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.blob_dir);
        let port = parse_or(&lookup, "ONBOARDING_PORT", defaults.port)?;

        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        Ok(Self {
            db_path,
            port,
            blob_dir,
            autosave_debounce: millis("ONBOARDING_AUTOSAVE_MS", defaults.autosave_debounce)?,
            step_timings: StepTimings {
                completing: millis(
                    "ONBOARDING_STEP_COMPLETE_MS",
                    defaults.step_timings.completing,
                )?,
                collapsing: millis(
                    "ONBOARDING_STEP_COLLAPSE_MS",
                    defaults.step_timings.collapsing,
                )?,
                activating: millis(
                    "ONBOARDING_STEP_ACTIVATE_MS",
                    defaults.step_timings.activating,
                )?,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}
