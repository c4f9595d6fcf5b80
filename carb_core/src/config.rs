//! Configuration file support for carbs.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/carbs/config.toml`.
//! Every value is request scoped: callers pass a `Config` into the pipeline
//! rather than reading process-wide state.

use crate::aggregator::WindowExpiry;
use crate::counteraction::OverlapPolicy;
use crate::curve::AbsorptionModel;
use crate::estimator::EstimatorOptions;
use crate::sink::OutputFormat;
use crate::types::minutes_duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub absorption: AbsorptionConfig,

    #[serde(default)]
    pub attribution: AttributionConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Absorption model parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbsorptionConfig {
    #[serde(default)]
    pub model: AbsorptionModel,

    #[serde(default = "default_absorption_minutes")]
    pub default_absorption_minutes: f64,

    #[serde(default = "default_overrun")]
    pub initial_absorption_time_overrun: f64,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            model: AbsorptionModel::default(),
            default_absorption_minutes: default_absorption_minutes(),
            initial_absorption_time_overrun: default_overrun(),
        }
    }
}

/// Attribution policies
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AttributionConfig {
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,

    #[serde(default)]
    pub window_expiry: WindowExpiry,
}

/// Output formatting
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Fixed grid spacing; boundary instants are used when absent
    #[serde(default)]
    pub step_minutes: Option<u32>,
}

// Default value functions
fn default_absorption_minutes() -> f64 {
    180.0
}

fn default_overrun() -> f64 {
    2.0
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::debug!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        base.join("carbs").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Estimator tuning derived from the absorption section
    pub fn estimator_options(&self) -> Result<EstimatorOptions> {
        let minutes = self.absorption.default_absorption_minutes;
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(Error::Config(format!(
                "default_absorption_minutes must be positive, got {}",
                minutes
            )));
        }
        Ok(EstimatorOptions {
            initial_absorption_time_overrun: self.absorption.initial_absorption_time_overrun,
            default_absorption_time: minutes_duration(minutes)?,
        })
    }
}
