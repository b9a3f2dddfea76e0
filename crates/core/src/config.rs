//! Serving configuration
//!
//! Loaded from TOML or JSON, or built from defaults plus `MODELSERVE_*`
//! environment variables.

use crate::batching::BatchingParameters;
use crate::error::{Error, Result};
use crate::sources::{FileSystemStoragePathSourceConfig, ServableToMonitor};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Version discovery
    #[serde(default)]
    pub storage_path_source: FileSystemStoragePathSourceConfig,

    /// Batching; `None` serves every call unbatched
    #[serde(default)]
    pub batching: Option<BatchingParameters>,
}

impl ServingConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ServingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: ServingConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = ServingConfig::default();

        // Storage path source
        if let Ok(secs) = std::env::var("MODELSERVE_POLL_WAIT_SECONDS") {
            config.storage_path_source.file_system_poll_wait_seconds =
                parse_env("MODELSERVE_POLL_WAIT_SECONDS", &secs)?;
        }
        if let Ok(name) = std::env::var("MODELSERVE_MODEL_NAME") {
            let base_path = std::env::var("MODELSERVE_MODEL_BASE_PATH").map_err(|_| {
                Error::Config(
                    "MODELSERVE_MODEL_BASE_PATH must be set with MODELSERVE_MODEL_NAME".to_string(),
                )
            })?;
            config
                .storage_path_source
                .servables
                .push(ServableToMonitor::new(name, base_path));
        }

        // Batching
        if let Ok(enabled) = std::env::var("MODELSERVE_ENABLE_BATCHING") {
            if parse_env::<bool>("MODELSERVE_ENABLE_BATCHING", &enabled)? {
                config.batching = Some(BatchingParameters::default());
            }
        }
        if let Some(batching) = config.batching.as_mut() {
            if let Ok(max) = std::env::var("MODELSERVE_MAX_BATCH_SIZE") {
                batching.max_batch_size = Some(parse_env("MODELSERVE_MAX_BATCH_SIZE", &max)?);
            }
            if let Ok(timeout) = std::env::var("MODELSERVE_BATCH_TIMEOUT_MICROS") {
                batching.batch_timeout_micros =
                    parse_env("MODELSERVE_BATCH_TIMEOUT_MICROS", &timeout)?;
            }
            if let Ok(threads) = std::env::var("MODELSERVE_NUM_BATCH_THREADS") {
                batching.num_batch_threads =
                    Some(parse_env("MODELSERVE_NUM_BATCH_THREADS", &threads)?);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise from the environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
            tracing::warn!(
                "Config file {} not found; using environment",
                p.as_ref().display()
            );
        }
        Self::from_env()
    }

    /// Validate both sections
    pub fn validate(&self) -> Result<()> {
        self.storage_path_source.validate()?;
        if let Some(batching) = &self.batching {
            batching.validate()?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {:?}", key, value)))
}
