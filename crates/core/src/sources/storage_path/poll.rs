//! File-system polling and version selection

use super::config::{FileSystemStoragePathSourceConfig, ServableToMonitor, ServableVersionPolicy};
use crate::error::{Error, Result};
use crate::servable::AspiredVersion;
use std::collections::{BTreeMap, HashSet};
use std::fs;

/// Parse a directory name as a version number.
///
/// The whole name must be ASCII digits; signs, whitespace and suffixes
/// disqualify it.
pub fn parse_version(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Index numeric children by version. When two children map to the same
/// number the one sorting last wins.
pub(crate) fn index_children_by_version(children: &[String]) -> BTreeMap<u64, String> {
    let mut sorted: Vec<&String> = children.iter().collect();
    sorted.sort();
    let mut by_version = BTreeMap::new();
    for child in sorted {
        let Some(version) = parse_version(child) else {
            continue;
        };
        if let Some(previous) = by_version.insert(version, child.clone()) {
            tracing::warn!(
                "Duplicate version directories detected. Version {} will be loaded from {}, {} will be ignored.",
                version,
                child,
                previous
            );
        }
    }
    by_version
}

/// Apply a servable's version policy to its indexed children
pub(crate) fn select_versions(
    servable: &ServableToMonitor,
    by_version: &BTreeMap<u64, String>,
) -> Vec<AspiredVersion> {
    let aspire = |version: u64, child: &String| {
        AspiredVersion::new(
            servable.servable_name.clone(),
            version,
            servable.base_path.join(child),
        )
    };

    match &servable.version_policy {
        ServableVersionPolicy::Latest { num_versions } => {
            let keep = (*num_versions).max(1) as usize;
            by_version
                .iter()
                .rev()
                .take(keep)
                .map(|(v, child)| aspire(*v, child))
                .collect()
        }
        ServableVersionPolicy::All => by_version
            .iter()
            .map(|(v, child)| aspire(*v, child))
            .collect(),
        ServableVersionPolicy::Specific { versions } => {
            let wanted: HashSet<u64> = versions.iter().copied().collect();
            let aspired: Vec<AspiredVersion> = by_version
                .iter()
                .filter(|(v, _)| wanted.contains(v))
                .map(|(v, child)| aspire(*v, child))
                .collect();
            for version in versions {
                if !by_version.contains_key(version) {
                    tracing::warn!(
                        "Version {} of servable {}, which was requested to be served as a 'specific' version, was not found in the file system",
                        version,
                        servable.servable_name
                    );
                }
            }
            aspired
        }
    }
}

/// List the base path of one servable and compute its aspired versions.
///
/// A missing or unreadable base path is an error, never an empty list, so a
/// transient outage cannot unload a servable.
pub(crate) fn poll_servable(servable: &ServableToMonitor) -> Result<Vec<AspiredVersion>> {
    if let Err(e) = fs::metadata(&servable.base_path) {
        return Err(Error::NotFound(format!(
            "Could not find base path {} for servable {} with error {}",
            servable.base_path.display(),
            servable.servable_name,
            e
        )));
    }

    let mut children = Vec::new();
    for entry in fs::read_dir(&servable.base_path)? {
        let entry = entry?;
        match entry.file_name().into_string() {
            Ok(name) => children.push(name),
            Err(raw) => tracing::debug!("Skipping non UTF-8 child {:?}", raw),
        }
    }

    let by_version = index_children_by_version(&children);
    let versions = select_versions(servable, &by_version);
    if versions.is_empty() {
        tracing::warn!(
            "No versions of servable {} found under base path {}. Did you forget to name your leaf directory as a number (eg. '/1/')?",
            servable.servable_name,
            servable.base_path.display()
        );
    }
    Ok(versions)
}

/// Fail with `NotFound` if any configured servable has no version on disk
pub(crate) fn fail_if_zero_versions(config: &FileSystemStoragePathSourceConfig) -> Result<()> {
    for servable in &config.servables {
        if poll_servable(servable)?.is_empty() {
            return Err(Error::NotFound(format!(
                "Unable to find a numerical version path for servable {} at: {}",
                servable.servable_name,
                servable.base_path.display()
            )));
        }
    }
    Ok(())
}
