//! Configuration for the speculation engine.
//!
//! Loaded from TOML. Every section uses `#[serde(default)]` so a partial file
//! (or none at all) yields a working configuration:
//!
//! ```toml
//! [speculation]
//! max_rule_based_sessions = 2
//! same_site_cross_origin = true
//!
//! [memory]
//! budget_percent = 15.0
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;

/// Environment variable naming the config file when no path is given.
pub const CONFIG_ENV_VAR: &str = "PRERENDER_CONFIG";

// =============================================================================
// Log format
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

// =============================================================================
// Speculation
// =============================================================================

/// Admission and lifecycle thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationConfig {
    /// Master switch. When false every request is rejected as disabled.
    pub enabled: bool,
    /// Experiment holdback: eligible requests are refused after eligibility.
    pub holdback: bool,
    /// Devices with less physical memory than this are treated as low-end.
    pub low_end_memory_floor_mb: u64,
    /// Concurrent rule-based sessions allowed.
    pub max_rule_based_sessions: usize,
    /// Allow renderer-initiated speculation of same-site cross-origin URLs,
    /// subject to a response opt-in.
    pub same_site_cross_origin: bool,
    /// Keep sessions alive for a bounded time while the owner is hidden.
    pub keep_alive_in_background: bool,
    /// Background keep-alive budget in milliseconds.
    pub background_timeout_ms: u64,
    /// Number of terminal statuses remembered after their host is destroyed.
    pub finished_history: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            holdback: false,
            low_end_memory_floor_mb: 1700,
            max_rule_based_sessions: 1,
            same_site_cross_origin: false,
            keep_alive_in_background: false,
            background_timeout_ms: 180_000,
            finished_history: 64,
        }
    }
}

impl SpeculationConfig {
    #[must_use]
    pub fn background_timeout(&self) -> Duration {
        Duration::from_millis(self.background_timeout_ms)
    }
}

// =============================================================================
// Memory governor
// =============================================================================

/// Memory budget enforced on rule-based sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryGovernorConfig {
    /// Whether rule-based sessions are sampled after start.
    pub enabled: bool,
    /// Share of total system memory the process may use, in percent.
    pub budget_percent: f64,
    /// Capacity of the sample report channel.
    pub channel_capacity: usize,
}

impl Default for MemoryGovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget_percent: 20.0,
            channel_capacity: 16,
        }
    }
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub speculation: SpeculationConfig,
    pub memory: MemoryGovernorConfig,
    pub logging: LogConfig,
}

impl Config {
    /// Parse, normalize and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Resolve the config path from an explicit argument, then
    /// `PRERENDER_CONFIG`.
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        explicit.map(Path::to_path_buf).or_else(|| {
            std::env::var_os(CONFIG_ENV_VAR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
    }

    /// Load from the resolved path, or fall back to defaults when none is set.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        match Self::resolve_path(explicit) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Clamp values that have an obvious meaning when zero.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.speculation.max_rule_based_sessions = self.speculation.max_rule_based_sessions.max(1);
        self.memory.channel_capacity = self.memory.channel_capacity.max(1);
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let budget = self.memory.budget_percent;
        if !budget.is_finite() || budget <= 0.0 || budget > 100.0 {
            return Err(ConfigError::ValidationError(format!(
                "memory.budget_percent must be in (0, 100], got {budget}"
            )));
        }
        if self.speculation.max_rule_based_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "speculation.max_rule_based_sessions must be at least 1".to_string(),
            ));
        }
        if self.memory.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "memory.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.speculation.keep_alive_in_background && self.speculation.background_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "speculation.background_timeout_ms must be positive when keep-alive is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }
}
