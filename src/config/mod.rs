//! Configuration for the orchestration core
//!
//! Loads ~/.config/muster/config.toml with every tunable threshold the
//! coordination layer uses: review cycle bounds, claim/heartbeat staleness
//! windows, queue-depth watermarks, and the enabled ideation categories.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete Muster configuration
///
/// All durations are stored as whole seconds so the TOML file stays
/// human-editable; accessor methods return `Duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusterConfig {
    /// Root directory for all persisted orchestration state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Maximum execute->review->reject cycles before escalating to a human
    #[serde(default = "default_max_review_cycles")]
    pub max_review_cycles: u32,

    /// Seconds before an in-review claim is considered abandoned (2 hours)
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,

    /// Seconds without a heartbeat before an agent is considered stuck (30 minutes)
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    /// Seconds before a category exhaustion flag expires (7 days)
    #[serde(default = "default_exhaustion_expiry_secs")]
    pub exhaustion_expiry_secs: u64,

    /// Seconds completed review items are retained before purge (7 days)
    #[serde(default = "default_review_retention_secs")]
    pub review_retention_secs: u64,

    /// Rolling window for category coverage reporting (30 days)
    #[serde(default = "default_coverage_window_secs")]
    pub coverage_window_secs: u64,

    /// Target average cycle time for the health check (4 hours)
    #[serde(default = "default_cycle_time_target_secs")]
    pub cycle_time_target_secs: u64,

    /// Maximum transition log entries retained per agent
    #[serde(default = "default_transition_log_cap")]
    pub transition_log_cap: usize,

    /// Queue depth below which ideation should be prioritized
    #[serde(default = "default_queue_low_watermark")]
    pub queue_low_watermark: usize,

    /// Queue depth above which ideation should be paused
    #[serde(default = "default_queue_high_watermark")]
    pub queue_high_watermark: usize,

    /// Seconds to wait for a worker to exit voluntarily before force-killing
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Ideation categories agents may explore, in no particular order
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    /// Worker command to spawn per agent (program followed by arguments)
    #[serde(default = "default_worker_command")]
    pub worker_command: Vec<String>,
}

fn default_state_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muster")
        .join("state")
}

fn default_max_review_cycles() -> u32 {
    3
}

fn default_claim_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_stuck_threshold_secs() -> u64 {
    30 * 60
}

fn default_exhaustion_expiry_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_review_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_coverage_window_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_cycle_time_target_secs() -> u64 {
    4 * 60 * 60
}

fn default_transition_log_cap() -> usize {
    1000
}

fn default_queue_low_watermark() -> usize {
    3
}

fn default_queue_high_watermark() -> usize {
    10
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_categories() -> Vec<String> {
    vec![
        "developer-tools".to_string(),
        "automation".to_string(),
        "data-visualization".to_string(),
        "productivity".to_string(),
        "testing".to_string(),
    ]
}

fn default_worker_command() -> Vec<String> {
    vec!["muster-worker".to_string()]
}

impl Default for MusterConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_review_cycles: default_max_review_cycles(),
            claim_timeout_secs: default_claim_timeout_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            exhaustion_expiry_secs: default_exhaustion_expiry_secs(),
            review_retention_secs: default_review_retention_secs(),
            coverage_window_secs: default_coverage_window_secs(),
            cycle_time_target_secs: default_cycle_time_target_secs(),
            transition_log_cap: default_transition_log_cap(),
            queue_low_watermark: default_queue_low_watermark(),
            queue_high_watermark: default_queue_high_watermark(),
            stop_grace_secs: default_stop_grace_secs(),
            categories: default_categories(),
            worker_command: default_worker_command(),
        }
    }
}

impl MusterConfig {
    /// Create a config rooted at the given state directory, defaults elsewhere
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    /// Get the default config file path (~/.config/muster/config.toml)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("muster")
            .join("config.toml")
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: MusterConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default path, falling back to defaults if absent
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| crate::MusterError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Basic sanity checks on thresholds
    pub fn validate(&self) -> Result<()> {
        if self.max_review_cycles == 0 {
            return Err(crate::MusterError::Config(
                "max_review_cycles must be at least 1".to_string(),
            ));
        }
        if self.queue_low_watermark >= self.queue_high_watermark {
            return Err(crate::MusterError::Config(format!(
                "queue_low_watermark ({}) must be below queue_high_watermark ({})",
                self.queue_low_watermark, self.queue_high_watermark
            )));
        }
        if self.worker_command.is_empty() {
            return Err(crate::MusterError::Config(
                "worker_command must name a program".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the enabled categories
    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    /// Set the worker command
    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = command;
        self
    }

    /// Set the claim timeout
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the stuck-agent threshold
    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold_secs = threshold.as_secs();
        self
    }

    /// Set the maximum review cycles
    pub fn with_max_review_cycles(mut self, cycles: u32) -> Self {
        self.max_review_cycles = cycles;
        self
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn exhaustion_expiry(&self) -> Duration {
        Duration::from_secs(self.exhaustion_expiry_secs)
    }

    pub fn review_retention(&self) -> Duration {
        Duration::from_secs(self.review_retention_secs)
    }

    pub fn coverage_window(&self) -> Duration {
        Duration::from_secs(self.coverage_window_secs)
    }

    pub fn cycle_time_target(&self) -> Duration {
        Duration::from_secs(self.cycle_time_target_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = MusterConfig::default();
        assert_eq!(config.max_review_cycles, 3);
        assert_eq!(config.claim_timeout(), Duration::from_secs(7200));
        assert_eq!(config.stuck_threshold(), Duration::from_secs(1800));
        assert_eq!(config.queue_low_watermark, 3);
        assert_eq!(config.queue_high_watermark, 10);
        assert!(!config.categories.is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let config = MusterConfig::new(temp.path().join("state"))
            .with_max_review_cycles(5)
            .with_categories(vec!["cli-tools".to_string()]);
        config.save(&path).unwrap();

        let loaded = MusterConfig::load(&path).unwrap();
        assert_eq!(loaded.max_review_cycles, 5);
        assert_eq!(loaded.categories, vec!["cli-tools".to_string()]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_review_cycles = 2\n").unwrap();

        let loaded = MusterConfig::load(&path).unwrap();
        assert_eq!(loaded.max_review_cycles, 2);
        assert_eq!(loaded.queue_high_watermark, 10);
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let mut config = MusterConfig::default();
        config.queue_low_watermark = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cycles() {
        let mut config = MusterConfig::default();
        config.max_review_cycles = 0;
        assert!(config.validate().is_err());
    }
}
