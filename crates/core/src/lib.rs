//! ModelServe Core - control plane for serving versioned models
//!
//! This crate decides *which* model versions should be live and *how* calls
//! reach them:
//!
//! - [`sources`]: watches base directories for numbered version folders and
//!   reports the aspired versions of each servable to a callback
//! - [`batching`]: admission control and batching for an execution session,
//!   backed by a worker pool shared across queues
//! - [`monitor`]: tracks servable lifecycle states published on an event bus
//!
//! Loading, unloading and running models is left to the embedding
//! application, which supplies an [`ExecutionSession`] and consumes the
//! aspired-versions callback.
//!
//! # Example
//!
//! ```ignore
//! use modelserve_core::batching::wrap_session_for_batching;
//! use modelserve_core::sources::{FileSystemStoragePathSource, aspired_versions_channel};
//! use modelserve_core::ServingConfig;
//!
//! let config = ServingConfig::load(Some("modelserve.toml"))?;
//!
//! let source = FileSystemStoragePathSource::create(config.storage_path_source.clone())?;
//! let (callback, updates) = aspired_versions_channel(16);
//! source.set_aspired_versions_callback(callback)?;
//!
//! let params = config.batching.unwrap_or_default();
//! let scheduler = params.build_scheduler()?;
//! let session = wrap_session_for_batching(&params, Some(scheduler), Some(my_session))?;
//! let outputs = session.run(inputs, vec!["scores".into()]).await?;
//! ```

pub mod batching;
pub mod config;
pub mod error;
pub mod monitor;
pub mod servable;
pub mod sources;
pub mod tensor;

pub use batching::{
    wrap_session_for_batching, BatchingParameters, BatchingSession, ExecutionSession,
    SharedBatchScheduler, TensorSignature,
};
pub use config::ServingConfig;
pub use error::{Error, Result};
pub use monitor::{EventBus, ManagerState, ServableState, ServableStateMonitor};
pub use servable::{AspiredVersion, ServableId};
pub use sources::{
    aspired_versions_channel, AspiredVersionsCallback, FileSystemStoragePathSource,
    FileSystemStoragePathSourceConfig,
};
pub use tensor::{DataType, TensorBuffer};

/// Initialize logging
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!("ModelServe core initialized");
    Ok(())
}
