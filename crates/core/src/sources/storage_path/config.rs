//! Configuration for the file-system storage path source

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Which of the numeric version directories under a base path to aspire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServableVersionPolicy {
    /// Serve the `num_versions` largest versions (at least one)
    Latest {
        /// How many versions to keep aspired
        num_versions: u32,
    },
    /// Serve every version found on disk
    All,
    /// Serve exactly these versions, if present
    Specific {
        /// Version numbers to serve
        versions: Vec<u64>,
    },
}

impl Default for ServableVersionPolicy {
    fn default() -> Self {
        ServableVersionPolicy::Latest { num_versions: 1 }
    }
}

/// A servable to monitor, keyed by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServableToMonitor {
    /// Servable name, unique within a config
    pub servable_name: String,

    /// Directory whose numeric children are versions
    pub base_path: PathBuf,

    /// Version selection policy
    #[serde(default)]
    pub version_policy: ServableVersionPolicy,
}

impl ServableToMonitor {
    /// Create an entry with the default (latest single version) policy
    pub fn new(servable_name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            servable_name: servable_name.into(),
            base_path: base_path.into(),
            version_policy: ServableVersionPolicy::default(),
        }
    }

    /// Use a different version policy
    pub fn with_version_policy(mut self, policy: ServableVersionPolicy) -> Self {
        self.version_policy = policy;
        self
    }
}

/// How the background poller is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSchedule {
    /// No background polling; callers drive polls explicitly
    Manual,
    /// A single poll right after the callback is registered
    Once,
    /// Poll on a fixed period
    Every(Duration),
}

/// File-system storage path source configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemStoragePathSourceConfig {
    /// Servables to monitor
    #[serde(default)]
    pub servables: Vec<ServableToMonitor>,

    /// Seconds between polls. Zero polls once, negative disables polling.
    /// Cannot change once a callback has been registered.
    #[serde(default = "default_poll_wait_seconds")]
    pub file_system_poll_wait_seconds: i64,

    /// Refuse configs in which any servable has no version on disk
    #[serde(default)]
    pub fail_if_zero_versions_at_startup: bool,

    /// Like `fail_if_zero_versions_at_startup`, and additionally never emit
    /// an empty aspired set for a servable
    #[serde(default)]
    pub servable_versions_always_present: bool,
}

fn default_poll_wait_seconds() -> i64 {
    1
}

impl Default for FileSystemStoragePathSourceConfig {
    fn default() -> Self {
        Self {
            servables: Vec::new(),
            file_system_poll_wait_seconds: default_poll_wait_seconds(),
            fail_if_zero_versions_at_startup: false,
            servable_versions_always_present: false,
        }
    }
}

impl FileSystemStoragePathSourceConfig {
    /// Create an empty config with the default polling period
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a servable
    pub fn with_servable(mut self, servable: ServableToMonitor) -> Self {
        self.servables.push(servable);
        self
    }

    /// Set the polling period in seconds
    pub fn with_poll_wait_seconds(mut self, seconds: i64) -> Self {
        self.file_system_poll_wait_seconds = seconds;
        self
    }

    /// Scheduling mode implied by `file_system_poll_wait_seconds`
    pub fn poll_schedule(&self) -> PollSchedule {
        match self.file_system_poll_wait_seconds {
            s if s < 0 => PollSchedule::Manual,
            0 => PollSchedule::Once,
            s => PollSchedule::Every(Duration::from_secs(s as u64)),
        }
    }

    /// True when a servable with this name is configured
    pub fn contains(&self, servable_name: &str) -> bool {
        self.servables
            .iter()
            .any(|s| s.servable_name == servable_name)
    }

    /// Check names are non-empty and unique and base paths are set
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for servable in &self.servables {
            if servable.servable_name.is_empty() {
                return Err(Error::invalid_argument("Servable name must not be empty"));
            }
            if servable.base_path.as_os_str().is_empty() {
                return Err(Error::invalid_argument(format!(
                    "Base path for servable {} must not be empty",
                    servable.servable_name
                )));
            }
            if !seen.insert(servable.servable_name.as_str()) {
                return Err(Error::invalid_argument(format!(
                    "Servable {} is configured more than once",
                    servable.servable_name
                )));
            }
        }
        Ok(())
    }

    /// Names present in `self` but missing from `new_config`
    pub(crate) fn deleted_servables(&self, new_config: &Self) -> Vec<String> {
        self.servables
            .iter()
            .filter(|s| !new_config.contains(&s.servable_name))
            .map(|s| s.servable_name.clone())
            .collect()
    }
}
