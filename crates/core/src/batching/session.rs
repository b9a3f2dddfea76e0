//! Batching session wrapper
//!
//! Wraps an [`ExecutionSession`] so that concurrent calls sharing a
//! signature are merged into one execution. Each call becomes a task on the
//! queue for its signature; when the batch closes its inputs are
//! concatenated along dimension 0, padded to an allowed batch size, run
//! once, and the outputs are sliced back to the callers.

use super::batch::{Batch, BatchTask};
use super::scheduler::{
    BatchQueue, ProcessBatchFn, QueueOptions, SharedBatchScheduler, WeakBatchQueue,
};
use crate::error::{Error, Result};
use crate::tensor::TensorBuffer;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Named tensors passed to or returned from a session
pub type NamedTensors = Vec<(String, TensorBuffer)>;

/// Input and output names of one entry point, order-insensitive
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorSignature {
    /// Sorted input tensor names
    pub input_names: BTreeSet<String>,
    /// Sorted output tensor names
    pub output_names: BTreeSet<String>,
}

impl TensorSignature {
    pub fn new<I, O, S1, S2>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator<Item = S1>,
        O: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            input_names: inputs.into_iter().map(Into::into).collect(),
            output_names: outputs.into_iter().map(Into::into).collect(),
        }
    }

    fn of_request(inputs: &[(String, TensorBuffer)], output_names: &[String]) -> Self {
        Self {
            input_names: inputs.iter().map(|(name, _)| name.clone()).collect(),
            output_names: output_names.iter().cloned().collect(),
        }
    }
}

/// A synchronous model execution session
pub trait ExecutionSession: Send + Sync + 'static {
    /// Signatures worth batching
    fn signatures(&self) -> Vec<TensorSignature>;

    /// Run the model, returning one tensor per requested output name in the
    /// same order
    fn run(&self, inputs: &[(String, TensorBuffer)], output_names: &[String])
        -> Result<Vec<TensorBuffer>>;
}

/// Options for a batching session
#[derive(Debug, Clone, Default)]
pub struct BatchingSessionOptions {
    /// Batch sizes the session accepts; merged batches are padded up to the
    /// next entry. Empty means any size.
    pub allowed_batch_sizes: Vec<usize>,
    /// Pad non-batch dimensions of inputs to the per-batch maximum
    pub pad_variable_length_inputs: bool,
    /// Create a queue for a call whose signature the session does not
    /// declare, instead of running it unbatched
    pub batch_unknown_signatures: bool,
}

type CompletionSender = oneshot::Sender<Result<Vec<TensorBuffer>>>;

struct CompletionState {
    pieces: Vec<Option<Vec<TensorBuffer>>>,
    remaining: usize,
    sender: Option<CompletionSender>,
}

/// Collects the results of every piece of one call and answers the caller
/// once all have arrived, or on the first failure
struct TaskCompletion {
    state: Mutex<CompletionState>,
}

impl TaskCompletion {
    fn new(sender: CompletionSender) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompletionState {
                pieces: vec![None],
                remaining: 1,
                sender: Some(sender),
            }),
        })
    }

    fn num_pieces(&self) -> usize {
        self.state.lock().pieces.len()
    }

    fn set_num_pieces(&self, n: usize) {
        let mut state = self.state.lock();
        state.pieces = vec![None; n];
        state.remaining = n;
    }

    fn complete_piece(&self, piece: usize, result: Result<Vec<TensorBuffer>>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.sender.is_none() {
            return;
        }
        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => {
                if let Some(sender) = state.sender.take() {
                    let _ = sender.send(Err(e));
                }
                return;
            }
        };

        let Some(slot) = state.pieces.get_mut(piece) else {
            tracing::error!("Batch piece {} is out of range", piece);
            return;
        };
        if slot.is_some() {
            tracing::error!("Batch piece {} completed twice", piece);
            return;
        }
        *slot = Some(outputs);
        state.remaining -= 1;
        if state.remaining > 0 {
            return;
        }

        let pieces: Vec<Vec<TensorBuffer>> = state.pieces.drain(..).flatten().collect();
        let assembled = assemble_pieces(pieces);
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(assembled);
        }
    }
}

/// Concatenate each output across pieces along dimension 0
fn assemble_pieces(mut pieces: Vec<Vec<TensorBuffer>>) -> Result<Vec<TensorBuffer>> {
    if pieces.len() == 1 {
        return Ok(pieces.remove(0));
    }
    let num_outputs = pieces.first().map_or(0, Vec::len);
    (0..num_outputs)
        .map(|i| {
            let parts: Vec<&TensorBuffer> = pieces.iter().map(|p| &p[i]).collect();
            TensorBuffer::concat(&parts)
        })
        .collect()
}

/// One call (or one piece of a split call) waiting in a batch
pub struct BatchingSessionTask {
    request_id: u64,
    /// Sorted by name
    inputs: NamedTensors,
    /// In the caller's order
    output_names: Vec<String>,
    size: usize,
    piece: usize,
    completion: Arc<TaskCompletion>,
}

impl BatchingSessionTask {
    /// Identifier shared by every piece of one call
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Input tensors, sorted by name
    pub fn inputs(&self) -> &[(String, TensorBuffer)] {
        &self.inputs
    }
}

impl BatchTask for BatchingSessionTask {
    fn size(&self) -> usize {
        self.size
    }
}

/// Split `task` so its first piece exactly fills `open_batch_remaining` and
/// every later piece holds at most `max_batch_size` rows. The caller still
/// observes a single result assembled from all pieces.
pub fn split_input_task(
    task: BatchingSessionTask,
    open_batch_remaining: usize,
    max_batch_size: usize,
) -> Result<Vec<BatchingSessionTask>> {
    if open_batch_remaining == 0 || max_batch_size == 0 {
        return Err(Error::invalid_argument(
            "Split sizes must be positive",
        ));
    }
    if task.completion.num_pieces() != 1 {
        return Err(Error::Internal(
            "A task may only be split once".to_string(),
        ));
    }

    let mut sizes = vec![open_batch_remaining.min(task.size)];
    let mut left = task.size - sizes[0];
    while left > 0 {
        let next = left.min(max_batch_size);
        sizes.push(next);
        left -= next;
    }
    if sizes.len() == 1 {
        return Ok(vec![task]);
    }

    let mut pieces = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for (piece, &size) in sizes.iter().enumerate() {
        let inputs = task
            .inputs
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor.slice_rows(start, size)?)))
            .collect::<Result<NamedTensors>>()?;
        pieces.push(BatchingSessionTask {
            request_id: task.request_id,
            inputs,
            output_names: task.output_names.clone(),
            size,
            piece,
            completion: Arc::clone(&task.completion),
        });
        start += size;
    }
    task.completion.set_num_pieces(pieces.len());
    Ok(pieces)
}

/// Smallest allowed size that holds `batch_size` rows
fn padded_batch_size(batch_size: usize, allowed_batch_sizes: &[usize]) -> Result<usize> {
    if allowed_batch_sizes.is_empty() {
        return Ok(batch_size);
    }
    allowed_batch_sizes
        .iter()
        .copied()
        .find(|&allowed| allowed >= batch_size)
        .ok_or_else(|| {
            Error::Internal(format!(
                "Batch size {} exceeds every allowed batch size {:?}",
                batch_size, allowed_batch_sizes
            ))
        })
}

/// Pad the non-batch dimensions of `parts` to their element-wise maximum
fn pad_to_common_shape(parts: &[&TensorBuffer]) -> Result<Vec<TensorBuffer>> {
    let rank = parts.first().map_or(0, |p| p.shape().len());
    if parts.iter().any(|p| p.shape().len() != rank) {
        return Err(Error::invalid_argument(
            "Cannot pad tensors of differing rank",
        ));
    }
    let mut target = vec![0usize; rank.saturating_sub(1)];
    for part in parts {
        for (t, d) in target.iter_mut().zip(&part.shape()[1..]) {
            *t = (*t).max(*d);
        }
    }
    parts.iter().map(|p| p.pad_inner_to(&target)).collect()
}

/// Merge, execute and split one batch. Returns each task's outputs in the
/// task's requested order.
fn run_merged_batch(
    session: &dyn ExecutionSession,
    options: &BatchingSessionOptions,
    signature: &TensorSignature,
    tasks: &[BatchingSessionTask],
) -> Result<Vec<Vec<TensorBuffer>>> {
    let batch_size: usize = tasks.iter().map(|t| t.size).sum();
    let padded_size = padded_batch_size(batch_size, &options.allowed_batch_sizes)?;

    let mut merged = Vec::with_capacity(signature.input_names.len());
    for (idx, name) in signature.input_names.iter().enumerate() {
        let parts: Vec<&TensorBuffer> = tasks.iter().map(|t| &t.inputs[idx].1).collect();
        let mut tensor = if options.pad_variable_length_inputs {
            let padded = pad_to_common_shape(&parts)?;
            TensorBuffer::concat(&padded.iter().collect::<Vec<_>>())?
        } else {
            TensorBuffer::concat(&parts)?
        };
        if padded_size > batch_size {
            tensor = tensor.pad_rows(padded_size - batch_size)?;
        }
        merged.push((name.clone(), tensor));
    }

    let output_names: Vec<String> = signature.output_names.iter().cloned().collect();
    let outputs = session.run(&merged, &output_names)?;
    if outputs.len() != output_names.len() {
        return Err(Error::execution(format!(
            "Session returned {} outputs for {} requested",
            outputs.len(),
            output_names.len()
        )));
    }
    for output in &outputs {
        if output.batch_size() != Some(padded_size) {
            return Err(Error::execution(format!(
                "Batched output tensor's 0th dimension {:?} does not equal the batch size {}",
                output.batch_size(),
                padded_size
            )));
        }
    }

    let mut offset = 0;
    let mut per_task = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut task_outputs = Vec::with_capacity(task.output_names.len());
        for name in &task.output_names {
            let idx = output_names
                .binary_search(name)
                .map_err(|_| Error::Internal(format!("Unknown output tensor {}", name)))?;
            task_outputs.push(outputs[idx].slice_rows(offset, task.size)?);
        }
        per_task.push(task_outputs);
        offset += task.size;
    }
    Ok(per_task)
}

fn process_batch(
    session: &dyn ExecutionSession,
    options: &BatchingSessionOptions,
    signature: &TensorSignature,
    batch: Batch<BatchingSessionTask>,
) {
    let tasks = batch.into_tasks();
    if tasks.is_empty() {
        return;
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        run_merged_batch(session, options, signature, &tasks)
    }))
    .unwrap_or_else(|payload| {
        Err(Error::execution(format!(
            "Session panicked while executing a batch: {}",
            panic_message(payload.as_ref())
        )))
    });
    match result {
        Ok(per_task) => {
            for (task, outputs) in tasks.iter().zip(per_task) {
                task.completion.complete_piece(task.piece, Ok(outputs));
            }
        }
        Err(e) => {
            tracing::warn!("Batched execution of {} tasks failed: {}", tasks.len(), e);
            for task in &tasks {
                task.completion.complete_piece(task.piece, Err(e.duplicate()));
            }
        }
    }
}

fn panic_message<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Removes an abandoned call's pieces from the open batch
struct CancelGuard {
    queue: WeakBatchQueue<BatchingSessionTask>,
    request_id: u64,
    armed: bool,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.request_id;
        let removed = self.queue.cancel_where(|t| t.request_id == id);
        if removed > 0 {
            tracing::debug!("Cancelled {} pending pieces of request {}", removed, id);
        }
    }
}

/// Session that batches calls before handing them to a wrapped session
pub struct BatchingSession {
    /// Dropped before the scheduler so remaining batches are flushed
    queues: RwLock<HashMap<TensorSignature, Arc<BatchQueue<BatchingSessionTask>>>>,
    scheduler: Arc<SharedBatchScheduler<BatchingSessionTask>>,
    queue_options: QueueOptions<BatchingSessionTask>,
    options: Arc<BatchingSessionOptions>,
    wrapped: Arc<dyn ExecutionSession>,
    next_request_id: AtomicU64,
}

impl fmt::Debug for BatchingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingSession")
            .field("queue_options", &self.queue_options)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BatchingSession {
    /// Create one queue per distinct signature the session exposes
    pub fn create(
        options: BatchingSessionOptions,
        queue_options: QueueOptions<BatchingSessionTask>,
        scheduler: Arc<SharedBatchScheduler<BatchingSessionTask>>,
        session: Arc<dyn ExecutionSession>,
    ) -> Result<Self> {
        let batching = Self {
            queues: RwLock::new(HashMap::new()),
            scheduler,
            queue_options,
            options: Arc::new(options),
            wrapped: session,
            next_request_id: AtomicU64::new(0),
        };
        {
            let mut queues = batching.queues.write();
            for signature in batching.wrapped.signatures() {
                if queues.contains_key(&signature) {
                    continue;
                }
                let queue = batching.add_signature_queue(&signature)?;
                queues.insert(signature, Arc::new(queue));
            }
        }
        Ok(batching)
    }

    fn add_signature_queue(
        &self,
        signature: &TensorSignature,
    ) -> Result<BatchQueue<BatchingSessionTask>> {
        let process: ProcessBatchFn<BatchingSessionTask> = {
            let session = Arc::clone(&self.wrapped);
            let options = Arc::clone(&self.options);
            let signature = signature.clone();
            Arc::new(move |batch: Batch<BatchingSessionTask>| {
                process_batch(&*session, &options, &signature, batch)
            })
        };
        let queue = self
            .scheduler
            .add_queue(self.queue_options.clone(), process)?;
        tracing::debug!(
            "Created batching queue for inputs {:?} outputs {:?}",
            signature.input_names,
            signature.output_names
        );
        Ok(queue)
    }

    /// Queue serving `signature`. Undeclared signatures get a queue on first
    /// use when `batch_unknown_signatures` is set, otherwise `None`.
    fn queue_for(
        &self,
        signature: &TensorSignature,
    ) -> Result<Option<Arc<BatchQueue<BatchingSessionTask>>>> {
        if let Some(queue) = self.queues.read().get(signature) {
            return Ok(Some(Arc::clone(queue)));
        }
        if !self.options.batch_unknown_signatures {
            return Ok(None);
        }

        let mut queues = self.queues.write();
        if let Some(queue) = queues.get(signature) {
            return Ok(Some(Arc::clone(queue)));
        }
        let queue = Arc::new(self.add_signature_queue(signature)?);
        queues.insert(signature.clone(), Arc::clone(&queue));
        Ok(Some(queue))
    }

    /// Signatures served through a batching queue
    pub fn batched_signatures(&self) -> Vec<TensorSignature> {
        let mut signatures: Vec<_> = self.queues.read().keys().cloned().collect();
        signatures.sort();
        signatures
    }

    /// Run a call, batching it with concurrent calls of the same signature.
    ///
    /// Dropping the returned future before it completes withdraws the call
    /// from the open batch if that batch has not closed yet.
    pub async fn run(
        &self,
        inputs: NamedTensors,
        output_names: Vec<String>,
    ) -> Result<Vec<TensorBuffer>> {
        let signature = TensorSignature::of_request(&inputs, &output_names);
        let Some(queue) = self.queue_for(&signature)? else {
            let session = Arc::clone(&self.wrapped);
            return tokio::task::spawn_blocking(move || session.run(&inputs, &output_names))
                .await
                .map_err(|e| Error::Internal(format!("Unbatched run failed to complete: {}", e)))?;
        };

        let (receiver, mut guard) = self.enqueue(&queue, inputs, output_names)?;
        let result = receiver.await;
        guard.disarm();
        result.unwrap_or_else(|_| Err(batch_dropped()))
    }

    /// Blocking form of [`run`](Self::run). Must not be called from within
    /// an async runtime.
    pub fn run_blocking(
        &self,
        inputs: NamedTensors,
        output_names: Vec<String>,
    ) -> Result<Vec<TensorBuffer>> {
        let signature = TensorSignature::of_request(&inputs, &output_names);
        let Some(queue) = self.queue_for(&signature)? else {
            return self.wrapped.run(&inputs, &output_names);
        };

        let (receiver, mut guard) = self.enqueue(&queue, inputs, output_names)?;
        let result = receiver.blocking_recv();
        guard.disarm();
        result.unwrap_or_else(|_| Err(batch_dropped()))
    }

    fn enqueue(
        &self,
        queue: &BatchQueue<BatchingSessionTask>,
        mut inputs: NamedTensors,
        output_names: Vec<String>,
    ) -> Result<(oneshot::Receiver<Result<Vec<TensorBuffer>>>, CancelGuard)> {
        let size = request_batch_size(&inputs)?;
        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(pair) = inputs.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(Error::invalid_argument(format!(
                "Input tensor {} was supplied more than once",
                pair[0].0
            )));
        }

        let (sender, receiver) = oneshot::channel();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        queue.schedule(BatchingSessionTask {
            request_id,
            inputs,
            output_names,
            size,
            piece: 0,
            completion: TaskCompletion::new(sender),
        })?;

        let guard = CancelGuard {
            queue: queue.downgrade(),
            request_id,
            armed: true,
        };
        Ok((receiver, guard))
    }
}

fn batch_dropped() -> Error {
    Error::Cancelled("Batch was dropped before producing a result".to_string())
}

/// Size of dimension 0, which every input must share
fn request_batch_size(inputs: &[(String, TensorBuffer)]) -> Result<usize> {
    let mut size = None;
    for (name, tensor) in inputs {
        let rows = tensor.batch_size().ok_or_else(|| {
            Error::invalid_argument(format!("Input tensor {} has no batch dimension", name))
        })?;
        match size {
            None => size = Some(rows),
            Some(expected) if expected != rows => {
                return Err(Error::invalid_argument(format!(
                    "Batching session input tensors must have equal 0th-dimension size; {} has {}, expected {}",
                    name, rows, expected
                )));
            }
            Some(_) => {}
        }
    }
    match size {
        Some(0) => Err(Error::invalid_argument(
            "Batching session task size must be positive",
        )),
        Some(rows) => Ok(rows),
        None => Err(Error::invalid_argument(
            "Batching session requests need at least one input tensor",
        )),
    }
}
