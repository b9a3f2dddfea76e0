//! Servable identity types shared by sources, monitors and managers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifies one version of a named servable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServableId {
    /// Servable (stream) name
    pub name: String,
    /// Version number
    pub version: u64,
}

impl ServableId {
    /// Create a new servable id
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ServableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{name: {} version: {}}}", self.name, self.version)
    }
}

/// A version the control plane wants loaded, with the storage path it should
/// be loaded from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspiredVersion {
    /// Servable id (name + version)
    pub id: ServableId,
    /// Location of the version on disk
    pub storage_path: PathBuf,
}

impl AspiredVersion {
    /// Create a new aspired version
    pub fn new(name: impl Into<String>, version: u64, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            id: ServableId::new(name, version),
            storage_path: storage_path.into(),
        }
    }

    /// Servable name
    pub fn servable_name(&self) -> &str {
        &self.id.name
    }

    /// Version number
    pub fn version(&self) -> u64 {
        self.id.version
    }
}
