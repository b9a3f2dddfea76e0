//! Sources of aspired versions
//!
//! A source tells a downstream lifecycle manager which versions of each
//! servable should be loaded. Every notification carries the *complete*
//! aspired set for one servable; an empty set means "unload everything".

pub mod periodic;
pub mod storage_path;

pub use periodic::PeriodicFunction;
pub use storage_path::{
    FileSystemStoragePathSource, FileSystemStoragePathSourceConfig, PollSchedule,
    ServableToMonitor, ServableVersionPolicy,
};

use crate::servable::AspiredVersion;
use crossbeam::channel::{self, Receiver};
use std::sync::Arc;

/// Receives `(servable_name, aspired_versions)` updates. Invoked serially for
/// a given servable.
pub type AspiredVersionsCallback = Arc<dyn Fn(&str, Vec<AspiredVersion>) + Send + Sync>;

/// One aspired-versions update delivered through a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AspiredVersionsMessage {
    /// Servable the update is for
    pub servable_name: String,
    /// Complete aspired set (empty = unload all)
    pub versions: Vec<AspiredVersion>,
}

/// Adapt the callback protocol to a bounded channel.
///
/// The returned callback blocks the notifying thread while the channel is
/// full, so a slow consumer throttles polling instead of buffering without
/// bound. Do not call `update_config` from the consumer loop while the
/// channel may be full.
pub fn aspired_versions_channel(
    capacity: usize,
) -> (AspiredVersionsCallback, Receiver<AspiredVersionsMessage>) {
    let (tx, rx) = channel::bounded(capacity);
    let callback: AspiredVersionsCallback = Arc::new(move |servable_name, versions| {
        let message = AspiredVersionsMessage {
            servable_name: servable_name.to_string(),
            versions,
        };
        if tx.send(message).is_err() {
            tracing::debug!(
                "Aspired-versions receiver dropped; discarding update for {}",
                servable_name
            );
        }
    });
    (callback, rx)
}
