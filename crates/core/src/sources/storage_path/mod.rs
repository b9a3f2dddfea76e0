//! File-system storage path source
//!
//! Aspires versions for a set of servables. For each servable it monitors a
//! base path, treats children whose names are numbers (e.g. `123`) as
//! versions, and emits the largest as the single aspired version (or others,
//! per the servable's version policy). Polling happens on a background
//! thread.
//!
//! For example, if a servable's base path is `/foo/bar` and a poll reveals
//! `/foo/bar/baz`, `/foo/bar/123` and `/foo/bar/456`, the callback receives
//! `{456, "/foo/bar/456"}`. If no numeric children are found the callback
//! receives an empty list.
//!
//! The monitored set can be replaced at any time with
//! [`FileSystemStoragePathSource::update_config`]. Servables present in the
//! old config but not the new one are immediately un-aspired (an empty list
//! is delivered) so that the consuming manager unloads them.

pub mod config;
pub mod poll;

pub use config::{
    FileSystemStoragePathSourceConfig, PollSchedule, ServableToMonitor, ServableVersionPolicy,
};

use super::periodic::PeriodicFunction;
use super::AspiredVersionsCallback;
use crate::error::{Error, Result};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;

/// State that is only reachable through the source's lock
struct SourceState {
    config: FileSystemStoragePathSourceConfig,
    callback: Option<AspiredVersionsCallback>,
}

/// Shared between the public handle and the polling thread
struct SourceCore {
    state: Mutex<SourceState>,
    /// Serializes every callback delivery. Re-entrant so a callback may call
    /// back into `update_config` on the same thread.
    delivery: ReentrantMutex<()>,
}

impl SourceCore {
    fn config(&self) -> FileSystemStoragePathSourceConfig {
        self.state.lock().config.clone()
    }

    fn callback(&self) -> Option<AspiredVersionsCallback> {
        self.state.lock().callback.clone()
    }

    /// Callback to use for `servable_name`, if it is still configured
    fn callback_for(&self, servable_name: &str) -> Option<AspiredVersionsCallback> {
        let state = self.state.lock();
        if !state.config.contains(servable_name) {
            return None;
        }
        state.callback.clone()
    }

    fn poll_file_system_and_invoke_callback(&self) {
        let _delivery = self.delivery.lock();
        let config = self.config();
        if self.callback().is_none() {
            return;
        }

        for servable in &config.servables {
            let versions = match poll::poll_servable(servable) {
                Ok(versions) => versions,
                Err(e) => {
                    tracing::error!(
                        "FileSystemStoragePathSource encountered a filesystem access error for servable {}: {}",
                        servable.servable_name,
                        e
                    );
                    continue;
                }
            };

            if versions.is_empty() && config.servable_versions_always_present {
                tracing::error!(
                    "Refusing to unload all versions for servable: {}",
                    servable.servable_name
                );
                continue;
            }

            // An earlier callback in this cycle may have re-entered
            // update_config and dropped this servable.
            let Some(callback) = self.callback_for(&servable.servable_name) else {
                continue;
            };

            for version in &versions {
                tracing::debug!(
                    "File-system polling update: Servable: {}; Servable path: {}; Polling frequency: {}",
                    version.id,
                    version.storage_path.display(),
                    config.file_system_poll_wait_seconds
                );
            }
            callback(&servable.servable_name, versions);
        }
    }
}

/// Background polling activity
enum Poller {
    NotStarted,
    Manual,
    OneShot(PeriodicFunction),
    Periodic(PeriodicFunction),
    Stopped,
}

/// Storage path source backed by the local file system
pub struct FileSystemStoragePathSource {
    core: Arc<SourceCore>,
    poller: Mutex<Poller>,
}

impl FileSystemStoragePathSource {
    /// Validate `config` and create a source. Polling starts once a callback
    /// is registered.
    pub fn create(config: FileSystemStoragePathSourceConfig) -> Result<Self> {
        let source = Self {
            core: Arc::new(SourceCore {
                state: Mutex::new(SourceState {
                    config: FileSystemStoragePathSourceConfig::default(),
                    callback: None,
                }),
                delivery: ReentrantMutex::new(()),
            }),
            poller: Mutex::new(Poller::NotStarted),
        };
        source.update_config(config)?;
        Ok(source)
    }

    /// Replace the set of monitored servables.
    ///
    /// Servables dropped from the config receive an empty aspired-versions
    /// notification before this returns. Changing the polling period once a
    /// callback has been registered fails with `InvalidState` and leaves the
    /// source untouched.
    pub fn update_config(&self, config: FileSystemStoragePathSourceConfig) -> Result<()> {
        config.validate()?;
        let _delivery = self.core.delivery.lock();

        {
            let state = self.core.state.lock();
            if state.callback.is_some()
                && config.file_system_poll_wait_seconds
                    != state.config.file_system_poll_wait_seconds
            {
                return Err(Error::InvalidState(
                    "Changing file_system_poll_wait_seconds is not supported".to_string(),
                ));
            }
        }

        if config.fail_if_zero_versions_at_startup || config.servable_versions_always_present {
            poll::fail_if_zero_versions(&config)?;
        }

        let (deleted, callback) = {
            let mut state = self.core.state.lock();
            let deleted = state.config.deleted_servables(&config);
            state.config = config;
            (deleted, state.callback.clone())
        };

        if let Some(callback) = callback {
            for servable_name in deleted {
                tracing::info!("Unaspiring all versions of removed servable {}", servable_name);
                callback(&servable_name, Vec::new());
            }
        }
        Ok(())
    }

    /// Register the callback that receives every aspired-versions update and
    /// start background polling if it has not started yet. Registering again
    /// replaces the callback without restarting polling.
    pub fn set_aspired_versions_callback(&self, callback: AspiredVersionsCallback) -> Result<()> {
        let schedule = {
            let mut state = self.core.state.lock();
            state.callback = Some(callback);
            state.config.poll_schedule()
        };

        let mut poller = self.poller.lock();
        if !matches!(*poller, Poller::NotStarted) {
            tracing::debug!("Aspired-versions callback replaced; polling already configured");
            return Ok(());
        }

        let core = Arc::clone(&self.core);
        *poller = match schedule {
            PollSchedule::Manual => Poller::Manual,
            PollSchedule::Once => Poller::OneShot(PeriodicFunction::once(
                "fs_storage_path_source_oneshot",
                move || core.poll_file_system_and_invoke_callback(),
            )?),
            PollSchedule::Every(interval) => Poller::Periodic(PeriodicFunction::periodic(
                "fs_storage_path_source_polling",
                interval,
                move || core.poll_file_system_and_invoke_callback(),
            )?),
        };
        Ok(())
    }

    /// Run one poll cycle on the calling thread
    pub fn poll_now(&self) {
        self.core.poll_file_system_and_invoke_callback();
    }

    /// Snapshot of the current config
    pub fn config(&self) -> FileSystemStoragePathSourceConfig {
        self.core.config()
    }

    /// True once background polling (or manual mode) has been set up
    pub fn is_polling_started(&self) -> bool {
        !matches!(*self.poller.lock(), Poller::NotStarted)
    }

    /// Stop background polling and wait for any in-flight poll to finish.
    /// No callback runs after this returns; later `poll_now` and
    /// `update_config` calls deliver nothing.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.poller.lock(), Poller::Stopped);
        match previous {
            Poller::OneShot(f) | Poller::Periodic(f) => {
                tracing::debug!("Stopping {}", f.name());
                drop(f);
            }
            Poller::NotStarted | Poller::Manual | Poller::Stopped => {}
        }

        let _delivery = self.core.delivery.lock();
        self.core.state.lock().callback = None;
    }
}

impl Drop for FileSystemStoragePathSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}
