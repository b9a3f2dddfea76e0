//! Batch admission control
//!
//! Calls to an execution session are grouped into batches so that the
//! model runs once per batch instead of once per call. The pieces:
//!
//! - [`SharedBatchScheduler`]: worker pool shared by every queue
//! - [`BatchQueue`]: per-signature admission and batch formation
//! - [`BatchingSession`]: merges calls, runs the wrapped session, and
//!   splits the results back out
//! - [`BatchingParameters`]: user-facing configuration

pub mod batch;
pub mod parameters;
pub mod scheduler;
pub mod session;

pub use batch::{Batch, BatchTask};
pub use parameters::{wrap_session_for_batching, BatchingParameters};
pub use scheduler::{
    BatchQueue, ProcessBatchFn, QueueOptions, SchedulerOptions, SharedBatchScheduler,
    SplitInputTaskFn, WeakBatchQueue, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_ENQUEUED_BATCHES,
};
pub use session::{
    split_input_task, BatchingSession, BatchingSessionOptions, BatchingSessionTask,
    ExecutionSession, NamedTensors, TensorSignature,
};
