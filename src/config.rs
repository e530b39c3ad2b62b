use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::tier::PricingTable;
use crate::orchestration::{AllocatorConfig, DynamicConfig, ExecutorConfig};
use crate::{Error, Result};

/// On-disk settings. Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub budget_dollars: f64,
    pub pricing: PricingTable,
    pub allocator: AllocatorConfig,
    pub executor: ExecutorConfig,
    pub dynamic: DynamicConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            budget_dollars: 0.05,
            pricing: PricingTable::default(),
            allocator: AllocatorConfig::default(),
            executor: ExecutorConfig::default(),
            dynamic: DynamicConfig::default(),
        }
    }
}

impl Config {
    pub fn tierflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tierflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::tierflow_dir()?.join("config.toml"))
    }

    /// Load from `~/.tierflow/config.toml`, or defaults if it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            budget = config.budget_dollars,
            max_concurrent = config.executor.max_concurrent,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.budget_dollars.is_finite() || self.budget_dollars < 0.0 {
            return Err(Error::InvalidBudget(self.budget_dollars));
        }
        self.pricing.validate().map_err(Error::Config)?;
        self.dynamic.validate().map_err(Error::Config)?;
        if self.executor.max_concurrent == 0 {
            return Err(Error::Config("executor.max_concurrent must be at least 1".to_string()));
        }
        Ok(())
    }
}
