use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::contract::{Thresholds, DEFAULT_THRESHOLD};
use crate::orchestration::{
    EngineConfig, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_DEPTH, DEFAULT_MAX_RETRIES,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Total attempts per unit.
    pub max_retries: u32,
    pub max_depth: usize,
    pub max_concurrency: usize,
    /// Object error threshold for nodes that do not set their own.
    pub epsilon_threshold: f64,
    /// Integration error threshold for nodes that do not set their own.
    pub lambda_threshold: f64,
    pub composition_discrepancy: f64,
    pub error_ceiling: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_depth: DEFAULT_MAX_DEPTH,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            epsilon_threshold: DEFAULT_THRESHOLD,
            lambda_threshold: DEFAULT_THRESHOLD,
            composition_discrepancy: 0.0,
            error_ceiling: None,
        }
    }
}

impl Config {
    pub fn validag_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".validag"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::validag_dir()?.join("validag.toml"))
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_retries = config.max_retries,
            max_depth = config.max_depth,
            max_concurrency = config.max_concurrency,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!(dir = %dir.display(), "Creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("epsilon_threshold", self.epsilon_threshold),
            ("lambda_threshold", self.lambda_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        self.engine_config().validate()
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.epsilon_threshold, self.lambda_threshold)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.max_retries,
            max_depth: self.max_depth,
            max_concurrency: self.max_concurrency,
            composition_discrepancy: self.composition_discrepancy,
            error_ceiling: self.error_ceiling,
        }
    }
}
