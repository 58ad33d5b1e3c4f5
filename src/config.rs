// =============================================================================
// Engine Settings — file-backed configuration with env overrides
// =============================================================================
//
// Every field carries a serde default so older settings files keep loading.
// Override precedence: constructor argument > environment > config file >
// default. Env names follow the QTSW2_* convention.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::ExecutionMode;

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_poll_secs() -> u64 {
    5
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_session_start() -> String {
    "17:00".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// The execution instrument this process is anchored to (e.g. MES).
    pub execution_instrument: String,

    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Log directory; defaults to `<project_root>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Bar data directory for dry-run pre-hydration; defaults to
    /// `<project_root>/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub spec_path: Option<PathBuf>,

    #[serde(default)]
    pub timetable_path: Option<PathBuf>,

    #[serde(default)]
    pub policy_path: Option<PathBuf>,

    #[serde(default = "default_poll_secs")]
    pub timetable_poll_secs: u64,

    #[serde(default = "default_true")]
    pub health_monitor_enabled: bool,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Default instrument session start, Chicago wall clock.
    #[serde(default = "default_session_start")]
    pub default_session_start: String,
}

impl EngineSettings {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine settings from {}", path.display()))?;
        let mut settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine settings from {}", path.display()))?;
        settings.apply_env();
        info!(
            path = %path.display(),
            mode = %settings.mode,
            execution_instrument = %settings.execution_instrument,
            project_root = %settings.project_root.display(),
            "engine settings loaded"
        );
        Ok(settings)
    }

    /// Environment overrides (config < env).
    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("QTSW2_PROJECT_ROOT") {
            if !root.trim().is_empty() {
                self.project_root = PathBuf::from(root);
            }
        }
        if let Ok(dir) = std::env::var("QTSW2_LOG_DIR") {
            if !dir.trim().is_empty() {
                self.log_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(v) = std::env::var("QTSW2_HEALTH_MONITOR_ENABLED") {
            match v.as_str() {
                "1" | "true" | "TRUE" | "True" => self.health_monitor_enabled = true,
                "0" | "false" | "FALSE" | "False" => self.health_monitor_enabled = false,
                other => warn!(value = other, "unrecognised QTSW2_HEALTH_MONITOR_ENABLED"),
            }
        }
    }

    /// Constructor-argument override (env < argument).
    pub fn with_project_root(mut self, root: Option<PathBuf>) -> Self {
        if let Some(root) = root {
            self.project_root = root;
        }
        self
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.project_root.join("logs"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.project_root.join("data"))
    }

    pub fn spec_path(&self) -> PathBuf {
        self.spec_path
            .clone()
            .unwrap_or_else(|| self.project_root.join("config").join("parity_spec.json"))
    }

    pub fn timetable_path(&self) -> PathBuf {
        self.timetable_path
            .clone()
            .unwrap_or_else(|| self.project_root.join("config").join("timetable.json"))
    }

    pub fn policy_path(&self) -> PathBuf {
        self.policy_path
            .clone()
            .unwrap_or_else(|| self.project_root.join("config").join("execution_policy.json"))
    }

    pub fn summary_dir(&self) -> PathBuf {
        self.project_root.join("summaries")
    }
}
