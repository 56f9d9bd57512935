//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast on malformed values.

use crate::error::{Error, Result};
use crate::host::AffinityThreadConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OS thread name for the affinity thread.
    pub thread_name: String,
    /// How many times a queued task yields to the run loop before it runs.
    pub yields_per_switch: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_name: "affinity".to_string(),
            yields_per_switch: 1,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let yields_per_switch = match std::env::var("AFFINITY_YIELDS") {
            Ok(raw) => parse_yields(&raw)?,
            Err(_) => defaults.yields_per_switch,
        };

        let config = Self {
            thread_name: std::env::var("AFFINITY_THREAD_NAME").unwrap_or(defaults.thread_name),
            yields_per_switch,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Host settings derived from this config.
    pub fn thread_config(&self) -> AffinityThreadConfig {
        AffinityThreadConfig {
            thread_name: self.thread_name.clone(),
            yields_per_switch: self.yields_per_switch,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.yields_per_switch == 0 {
            return Err(Error::Config(
                "yields_per_switch must be at least 1".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(Error::Config("thread_name must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_yields(raw: &str) -> Result<u32> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("AFFINITY_YIELDS must be a positive integer, got {raw:?}")))
}
