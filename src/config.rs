// ============================================================================
// ENGINE CONFIG — backend choice, adapter preference, watchdog, self-test
// ============================================================================

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// GPU when a healthy session exists, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::Cpu => "cpu",
            Backend::Gpu => "gpu",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "cpu" => Ok(Backend::Cpu),
            "gpu" => Ok(Backend::Gpu),
            other => Err(format!("unknown backend '{}' (expected auto, cpu or gpu)", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub backend: Backend,
    /// "high performance" or "low power".
    pub preferred_gpu: String,
    pub force_reduced: bool,
    pub watchdog_ms: u64,
    pub self_test_budget_ms: u64,
    pub self_test_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            preferred_gpu: "high performance".to_string(),
            force_reduced: false,
            watchdog_ms: 5000,
            self_test_budget_ms: 50,
            self_test_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with whatever the JSON file sets.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(text)?;
        Ok(config)
    }

    pub fn cpu_only() -> Self {
        Self {
            backend: Backend::Cpu,
            ..Self::default()
        }
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms.max(1))
    }
}
