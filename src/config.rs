//! Configuration management for the penalty box.
//!
//! The library does not load configuration on its own; applications that keep
//! their rate-limit policies in a YAML file can parse it with
//! [`PenaltyBoxConfig::from_file`] and hand it to
//! [`Controller::from_config`](crate::Controller::from_config).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{PenaltyBoxError, Result};
use crate::penalty::{GroupOptions, MAX_DURATION};

/// Main configuration for the penalty box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyBoxConfig {
    /// Period of the background sweep in seconds
    #[serde(default = "default_clear_interval")]
    pub clear_interval_secs: u64,

    /// Overrides for the default group
    #[serde(default)]
    pub default: Option<GroupSettings>,

    /// Map of group name to group settings
    #[serde(default)]
    pub groups: HashMap<String, GroupSettings>,
}

/// Settings for a single group, as written in the configuration file.
///
/// Unset fields fall back to the documented defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    /// Session lifetime since last activity, in seconds
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// First backoff delay, in milliseconds
    #[serde(default)]
    pub initial_interval_ms: Option<u64>,

    /// Growth factor per backoff stage
    #[serde(default)]
    pub multiplier: Option<f64>,

    /// Backoff ceiling, in milliseconds
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

impl Default for PenaltyBoxConfig {
    fn default() -> Self {
        Self {
            clear_interval_secs: default_clear_interval(),
            default: None,
            groups: HashMap::new(),
        }
    }
}

fn default_clear_interval() -> u64 {
    60
}

impl GroupSettings {
    /// Convert to the options accepted by the controller.
    pub fn to_options(&self) -> GroupOptions {
        GroupOptions {
            ttl: self.ttl_secs.map(Duration::from_secs),
            initial_interval: self.initial_interval_ms.map(Duration::from_millis),
            multiplier: self.multiplier,
            max_interval: self.max_interval_ms.map(Duration::from_millis),
        }
    }

    fn validate(&self, group: &str) -> Result<()> {
        let too_long = |d: Option<Duration>| d.is_some_and(|d| d > MAX_DURATION);
        if too_long(self.ttl_secs.map(Duration::from_secs)) {
            return Err(invalid(group, "ttl must not exceed one century"));
        }
        if too_long(self.initial_interval_ms.map(Duration::from_millis))
            || too_long(self.max_interval_ms.map(Duration::from_millis))
        {
            return Err(invalid(group, "backoff intervals must not exceed one century"));
        }

        let config = self.to_options().build();

        if config.ttl.is_zero() {
            return Err(invalid(group, "ttl must be greater than zero"));
        }
        if config.initial_interval.is_zero() {
            return Err(invalid(group, "initial interval must be greater than zero"));
        }
        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            return Err(invalid(group, "multiplier must be a finite number >= 1"));
        }
        if config.max_interval < config.initial_interval {
            return Err(invalid(group, "max interval must not be below the initial interval"));
        }

        Ok(())
    }
}

fn invalid(group: &str, reason: &str) -> PenaltyBoxError {
    PenaltyBoxError::Config(format!("group '{}': {}", group, reason))
}

impl PenaltyBoxConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading penalty box configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PenaltyBoxError::Config(format!("Failed to parse penalty box config: {}", e)))
    }

    /// Period of the background sweep.
    pub fn clear_interval(&self) -> Duration {
        Duration::from_secs(self.clear_interval_secs)
    }

    /// Reject values the backoff engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.clear_interval_secs == 0 {
            return Err(PenaltyBoxError::Config(
                "clear interval must be greater than zero".to_string(),
            ));
        }
        if self.clear_interval() > MAX_DURATION {
            return Err(PenaltyBoxError::Config(
                "clear interval must not exceed one century".to_string(),
            ));
        }

        if let Some(ref settings) = self.default {
            settings.validate(crate::penalty::DEFAULT_GROUP)?;
        }
        for (group, settings) in &self.groups {
            settings.validate(group)?;
        }

        Ok(())
    }
}
