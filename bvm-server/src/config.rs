//! Configuration resolution for bvm-server
//!
//! Two-tier resolution: environment variables override the optional TOML
//! file, which overrides built-in defaults. The TOML path itself comes from
//! `BVM_SERVER_CONFIG` (default `bvm-server.toml` beside the binary's working
//! directory; a missing file is not an error).

use bvm_common::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener
    pub bind_addr: String,
    /// Overall wall-clock budget for one analysis pipeline, in seconds
    pub pipeline_budget_secs: u64,
    /// Enabled answer providers, by name
    pub providers: Vec<String>,
    /// Flat credits debited per run
    pub credits_base: i64,
    /// Credits debited per resolved prompt × provider unit
    pub credits_per_unit: i64,
    /// Starting balance granted to a first-seen actor
    pub starting_balance: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5840".to_string(),
            pipeline_budget_secs: 300,
            providers: vec![
                "openai".to_string(),
                "anthropic".to_string(),
                "google".to_string(),
            ],
            credits_base: 10,
            credits_per_unit: 1,
            starting_balance: 1000,
        }
    }
}

impl ServerConfig {
    /// Load config: defaults ← TOML file ← environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("BVM_SERVER_CONFIG")
            .unwrap_or_else(|_| "bvm-server.toml".to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("BVM_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(budget) = std::env::var("BVM_PIPELINE_BUDGET_SECS") {
            match budget.parse() {
                Ok(secs) => self.pipeline_budget_secs = secs,
                Err(_) => warn!("Ignoring unparseable BVM_PIPELINE_BUDGET_SECS={}", budget),
            }
        }
        if let Ok(providers) = std::env::var("BVM_PROVIDERS") {
            self.providers = providers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline_budget_secs == 0 {
            return Err(Error::Config(
                "pipeline_budget_secs must be greater than zero".to_string(),
            ));
        }
        if self.providers.is_empty() {
            return Err(Error::Config(
                "at least one answer provider must be enabled".to_string(),
            ));
        }
        Ok(())
    }
}
