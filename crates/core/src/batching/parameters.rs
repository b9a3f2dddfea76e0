//! Batching parameters and session wrapping

use super::scheduler::{
    QueueOptions, SchedulerOptions, SharedBatchScheduler, SplitInputTaskFn,
    DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_ENQUEUED_BATCHES,
};
use super::session::{
    split_input_task, BatchingSession, BatchingSessionOptions, BatchingSessionTask,
    ExecutionSession,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// User-facing batching configuration.
///
/// Unset optional fields take the scheduler's queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingParameters {
    /// Maximum total size of one batch
    #[serde(default)]
    pub max_batch_size: Option<usize>,

    /// How long a partial batch waits for more work
    #[serde(default)]
    pub batch_timeout_micros: u64,

    /// Bound on queued batches per signature
    #[serde(default)]
    pub max_enqueued_batches: Option<usize>,

    /// Worker threads for a scheduler built from these parameters
    #[serde(default)]
    pub num_batch_threads: Option<usize>,

    /// Worker thread name prefix
    #[serde(default)]
    pub thread_pool_name: Option<String>,

    /// Sizes batches are padded up to. If set, the last entry must equal
    /// the max batch size.
    #[serde(default)]
    pub allowed_batch_sizes: Vec<usize>,

    /// Pad non-batch dimensions of inputs to a common shape
    #[serde(default)]
    pub pad_variable_length_inputs: bool,

    /// Split tasks across batches instead of starting a new batch
    #[serde(default)]
    pub enable_large_batch_splitting: bool,

    /// Give calls with an undeclared signature their own queue on first use
    /// instead of running them unbatched
    #[serde(default)]
    pub batch_unknown_signatures: bool,
}

impl BatchingParameters {
    /// `max_batch_size`, or the queue default when unset
    pub fn effective_max_batch_size(&self) -> usize {
        self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE)
    }

    /// Reject parameters the batching layer cannot honor
    pub fn validate(&self) -> Result<()> {
        let max_batch_size = self.effective_max_batch_size();
        if max_batch_size == 0 {
            return Err(Error::invalid_argument("max_batch_size must be positive"));
        }
        if self.max_enqueued_batches == Some(0) {
            return Err(Error::invalid_argument(
                "max_enqueued_batches must be positive",
            ));
        }
        if self.num_batch_threads == Some(0) {
            return Err(Error::invalid_argument("num_batch_threads must be positive"));
        }

        let Some(&last) = self.allowed_batch_sizes.last() else {
            return Ok(());
        };
        let mut previous = 0;
        for &size in &self.allowed_batch_sizes {
            if size <= previous {
                return Err(Error::invalid_argument(format!(
                    "allowed_batch_sizes entries must be positive and strictly increasing; got {:?}",
                    self.allowed_batch_sizes
                )));
            }
            previous = size;
        }
        if last != max_batch_size {
            return Err(Error::invalid_argument(format!(
                "Last entry in allowed_batch_sizes must match max_batch_size; last entry was {}; expected {}",
                last, max_batch_size
            )));
        }
        Ok(())
    }

    /// Options for a scheduler sized by these parameters
    pub fn scheduler_options(&self) -> SchedulerOptions {
        let defaults = SchedulerOptions::default();
        SchedulerOptions {
            num_batch_threads: self.num_batch_threads.unwrap_or(defaults.num_batch_threads),
            thread_pool_name: self
                .thread_pool_name
                .clone()
                .unwrap_or(defaults.thread_pool_name),
        }
    }

    /// Per-signature queue options
    pub fn queue_options(&self) -> QueueOptions<BatchingSessionTask> {
        let split_input_task_fn = if self.enable_large_batch_splitting {
            let split: SplitInputTaskFn<BatchingSessionTask> = Arc::new(split_input_task);
            Some(split)
        } else {
            None
        };
        QueueOptions {
            max_batch_size: self.effective_max_batch_size(),
            batch_timeout: Duration::from_micros(self.batch_timeout_micros),
            max_enqueued_batches: self
                .max_enqueued_batches
                .unwrap_or(DEFAULT_MAX_ENQUEUED_BATCHES),
            enable_large_batch_splitting: self.enable_large_batch_splitting,
            split_input_task_fn,
        }
    }

    /// Options for executing merged batches
    pub fn session_options(&self) -> BatchingSessionOptions {
        BatchingSessionOptions {
            allowed_batch_sizes: self.allowed_batch_sizes.clone(),
            pad_variable_length_inputs: self.pad_variable_length_inputs,
            batch_unknown_signatures: self.batch_unknown_signatures,
        }
    }

    /// Build a scheduler sized by these parameters
    pub fn build_scheduler(&self) -> Result<Arc<SharedBatchScheduler<BatchingSessionTask>>> {
        self.validate()?;
        SharedBatchScheduler::new(self.scheduler_options())
    }
}

/// Wrap `session` so that its calls are batched on `scheduler`.
///
/// Fails with `Internal` when either handle is missing and with
/// `InvalidArgument` when the parameters are inconsistent.
pub fn wrap_session_for_batching(
    params: &BatchingParameters,
    scheduler: Option<Arc<SharedBatchScheduler<BatchingSessionTask>>>,
    session: Option<Arc<dyn ExecutionSession>>,
) -> Result<BatchingSession> {
    tracing::info!("Wrapping session to perform batch processing");

    let scheduler = scheduler.ok_or_else(|| Error::Internal("batch_scheduler not set".to_string()))?;
    let session = session.ok_or_else(|| Error::Internal("session not set".to_string()))?;

    params.validate()?;
    BatchingSession::create(
        params.session_options(),
        params.queue_options(),
        scheduler,
        session,
    )
}
