//! Shared batch scheduler
//!
//! A fixed pool of worker threads serves any number of queues. Each queue
//! groups incoming tasks into batches of at most `max_batch_size` and hands
//! closed batches to its own processing callback. Queues are scanned
//! round-robin so a busy queue cannot starve the others, and a queue never
//! has more than one batch executing at a time, which keeps its batches in
//! strict arrival order.

use super::batch::{Batch, BatchTask};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default upper bound on the total size of one batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Default number of batches a queue may hold before rejecting work
pub const DEFAULT_MAX_ENQUEUED_BATCHES: usize = 10;

/// Executes one closed batch. Called on a scheduler worker thread.
pub type ProcessBatchFn<T> = Arc<dyn Fn(Batch<T>) + Send + Sync>;

/// Splits a task into pieces: the first piece has size
/// `open_batch_remaining`, the rest at most `max_batch_size`.
pub type SplitInputTaskFn<T> = Arc<dyn Fn(T, usize, usize) -> Result<Vec<T>> + Send + Sync>;

/// Scheduler-wide options
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Worker threads shared by every queue
    pub num_batch_threads: usize,
    /// Worker thread name prefix
    pub thread_pool_name: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            num_batch_threads: num_cpus::get(),
            thread_pool_name: "batch_threads".to_string(),
        }
    }
}

/// Per-queue options
pub struct QueueOptions<T> {
    /// Maximum total size of one batch
    pub max_batch_size: usize,
    /// How long a non-empty open batch may wait for more tasks
    pub batch_timeout: Duration,
    /// Closed plus open batches the queue may hold
    pub max_enqueued_batches: usize,
    /// Split tasks that do not fit the open batch instead of starting a
    /// new one
    pub enable_large_batch_splitting: bool,
    /// Required when splitting is enabled
    pub split_input_task_fn: Option<SplitInputTaskFn<T>>,
}

impl<T> Default for QueueOptions<T> {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_timeout: Duration::ZERO,
            max_enqueued_batches: DEFAULT_MAX_ENQUEUED_BATCHES,
            enable_large_batch_splitting: false,
            split_input_task_fn: None,
        }
    }
}

impl<T> Clone for QueueOptions<T> {
    fn clone(&self) -> Self {
        Self {
            max_batch_size: self.max_batch_size,
            batch_timeout: self.batch_timeout,
            max_enqueued_batches: self.max_enqueued_batches,
            enable_large_batch_splitting: self.enable_large_batch_splitting,
            split_input_task_fn: self.split_input_task_fn.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueOptions")
            .field("max_batch_size", &self.max_batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("max_enqueued_batches", &self.max_enqueued_batches)
            .field(
                "enable_large_batch_splitting",
                &self.enable_large_batch_splitting,
            )
            .field("split_input_task_fn", &self.split_input_task_fn.is_some())
            .finish()
    }
}

impl<T> QueueOptions<T> {
    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::invalid_argument("max_batch_size must be positive"));
        }
        if self.max_enqueued_batches == 0 {
            return Err(Error::invalid_argument(
                "max_enqueued_batches must be positive",
            ));
        }
        if self.enable_large_batch_splitting && self.split_input_task_fn.is_none() {
            return Err(Error::invalid_argument(
                "split_input_task_fn must be set when enable_large_batch_splitting is true",
            ));
        }
        Ok(())
    }
}

/// Result of asking a queue for work
enum Poll<T> {
    Ready(Batch<T>),
    WaitUntil(Instant),
    Idle,
}

struct QueueState<T> {
    /// Closed batches in arrival order, optionally followed by the open one
    batches: VecDeque<Batch<T>>,
    in_flight: bool,
    /// Set when the queue handle is dropped
    closing: bool,
    /// Set when the scheduler shuts down; no further tasks are admitted
    stopped: bool,
}

impl<T: BatchTask> QueueState<T> {
    fn open_batch(&mut self) -> Option<&mut Batch<T>> {
        self.batches.back_mut().filter(|b| !b.is_closed())
    }

    fn open_batch_remaining(&self, max_batch_size: usize) -> usize {
        match self.batches.back() {
            Some(b) if !b.is_closed() => max_batch_size.saturating_sub(b.size()),
            _ => 0,
        }
    }

    fn new_batches_allowed(&self, max_enqueued_batches: usize) -> usize {
        max_enqueued_batches.saturating_sub(self.batches.len())
    }

    fn scheduling_capacity(&self, options: &QueueOptions<T>) -> usize {
        self.new_batches_allowed(options.max_enqueued_batches) * options.max_batch_size
            + self.open_batch_remaining(options.max_batch_size)
    }

    /// Close the open batch (if any) and start a fresh one
    fn start_new_batch(&mut self) {
        if let Some(open) = self.open_batch() {
            if open.is_empty() {
                return;
            }
            open.close();
        }
        self.batches.push_back(Batch::new());
    }

    fn add_to_open_batch(&mut self, task: T, max_batch_size: usize) {
        if self.open_batch_remaining(max_batch_size) < task.size() {
            self.start_new_batch();
        }
        if let Some(open) = self.open_batch() {
            open.add_task(task);
            if open.size() >= max_batch_size {
                open.close();
            }
        }
    }

    fn enqueue(&mut self, task: T, options: &QueueOptions<T>) -> Result<()> {
        let max = options.max_batch_size;
        if task.size() <= self.open_batch_remaining(max) {
            self.add_to_open_batch(task, max);
            return Ok(());
        }

        let split_fn = match (&options.split_input_task_fn, options.enable_large_batch_splitting) {
            (Some(split_fn), true) => split_fn,
            _ => {
                self.add_to_open_batch(task, max);
                return Ok(());
            }
        };

        let mut remaining = self.open_batch_remaining(max);
        if remaining == 0 {
            self.start_new_batch();
            remaining = max;
        }
        let size = task.size();
        let pieces = split_fn(task, remaining, max)?;
        let total: usize = pieces.iter().map(BatchTask::size).sum();
        if total != size || pieces.iter().any(|p| p.size() == 0 || p.size() > max) {
            return Err(Error::Internal(format!(
                "Splitting a task of size {} produced pieces of sizes {:?}",
                size,
                pieces.iter().map(BatchTask::size).collect::<Vec<_>>()
            )));
        }
        for piece in pieces {
            self.add_to_open_batch(piece, max);
        }
        Ok(())
    }

    fn num_enqueued_tasks(&self) -> usize {
        self.batches.iter().map(Batch::num_tasks).sum()
    }

    fn is_drained(&self) -> bool {
        !self.in_flight && self.batches.iter().all(Batch::is_empty)
    }
}

/// One queue's options, processing callback, and batches
struct QueueCore<T> {
    options: QueueOptions<T>,
    process: ProcessBatchFn<T>,
    state: Mutex<QueueState<T>>,
}

impl<T: BatchTask> QueueCore<T> {
    /// Pop the front batch if it may run now
    fn take_ready_batch(&self, now: Instant, flush: bool) -> Poll<T> {
        let mut state = self.state.lock();
        if state.in_flight {
            return Poll::Idle;
        }
        let flush = flush || state.closing;
        let Some(front) = state.batches.front() else {
            return Poll::Idle;
        };
        if front.is_empty() {
            return Poll::Idle;
        }
        let deadline = front.created_at() + self.options.batch_timeout;
        if front.is_closed() || flush || deadline <= now {
            let Some(mut batch) = state.batches.pop_front() else {
                return Poll::Idle;
            };
            batch.close();
            state.in_flight = true;
            Poll::Ready(batch)
        } else {
            Poll::WaitUntil(deadline)
        }
    }

    fn run_batch(&self, batch: Batch<T>) {
        tracing::debug!(
            "Processing batch of {} tasks (size {})",
            batch.num_tasks(),
            batch.size()
        );
        let process = Arc::clone(&self.process);
        if panic::catch_unwind(AssertUnwindSafe(move || process(batch))).is_err() {
            tracing::error!("Batch processing callback panicked; its tasks were dropped");
        }
        self.state.lock().in_flight = false;
    }

    /// No batches left and nothing running
    fn is_drained(&self) -> bool {
        self.state.lock().is_drained()
    }

    fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.closing && state.is_drained()
    }
}

struct SchedulerState<T> {
    queues: Vec<Arc<QueueCore<T>>>,
    next_queue: usize,
    /// Bumped on every change that may create work
    generation: u64,
    shutting_down: bool,
}

struct SchedulerShared<T> {
    state: Mutex<SchedulerState<T>>,
    work_available: Condvar,
}

impl<T> SchedulerShared<T> {
    fn notify(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.work_available.notify_all();
    }
}

/// Pool of worker threads shared by many batch queues
pub struct SharedBatchScheduler<T: BatchTask> {
    shared: Arc<SchedulerShared<T>>,
    workers: Vec<JoinHandle<()>>,
    options: SchedulerOptions,
}

impl<T: BatchTask> SharedBatchScheduler<T> {
    /// Start the worker pool
    pub fn new(options: SchedulerOptions) -> Result<Arc<Self>> {
        if options.num_batch_threads == 0 {
            return Err(Error::invalid_argument("num_batch_threads must be positive"));
        }

        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                queues: Vec::new(),
                next_queue: 0,
                generation: 0,
                shutting_down: false,
            }),
            work_available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(options.num_batch_threads);
        for i in 0..options.num_batch_threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}_{}", options.thread_pool_name, i))
                .spawn(move || worker_loop(worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.state.lock().shutting_down = true;
                    shared.notify();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            "Started shared batch scheduler '{}' with {} threads",
            options.thread_pool_name,
            options.num_batch_threads
        );

        Ok(Arc::new(Self {
            shared,
            workers,
            options,
        }))
    }

    /// Register a queue whose closed batches are passed to `process`
    pub fn add_queue(
        &self,
        options: QueueOptions<T>,
        process: ProcessBatchFn<T>,
    ) -> Result<BatchQueue<T>> {
        options.validate()?;
        let core = Arc::new(QueueCore {
            options,
            process,
            state: Mutex::new(QueueState {
                batches: VecDeque::new(),
                in_flight: false,
                closing: false,
                stopped: false,
            }),
        });

        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(Error::unavailable("Batch scheduler is shutting down"));
            }
            state.queues.push(Arc::clone(&core));
        }

        Ok(BatchQueue {
            core,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Scheduler options
    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Number of live queues
    pub fn num_queues(&self) -> usize {
        self.shared.state.lock().queues.len()
    }
}

impl<T: BatchTask> Drop for SharedBatchScheduler<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            state.generation = state.generation.wrapping_add(1);
            // Admission is refused under each queue's own lock, so a task is
            // either enqueued before workers can observe the queue drained
            // or rejected.
            for queue in &state.queues {
                queue.state.lock().stopped = true;
            }
        }
        self.shared.work_available.notify_all();

        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                tracing::warn!("Batch scheduler dropped on one of its own workers; not joining it");
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Batch scheduler worker panicked");
            }
        }
        tracing::debug!("Shared batch scheduler '{}' stopped", self.options.thread_pool_name);
    }
}

fn worker_loop<T: BatchTask>(shared: Arc<SchedulerShared<T>>) {
    loop {
        let (queues, generation, shutting_down) = {
            let mut state = shared.state.lock();
            state.queues.retain(|q| !q.is_finished());
            if state.shutting_down && state.queues.iter().all(|q| q.is_drained()) {
                break;
            }
            let n = state.queues.len();
            let start = if n == 0 { 0 } else { state.next_queue % n };
            state.next_queue = state.next_queue.wrapping_add(1);
            let mut ordered = Vec::with_capacity(n);
            ordered.extend(state.queues[start..].iter().cloned());
            ordered.extend(state.queues[..start].iter().cloned());
            (ordered, state.generation, state.shutting_down)
        };

        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut work = None;
        for queue in &queues {
            match queue.take_ready_batch(now, shutting_down) {
                Poll::Ready(batch) => {
                    work = Some((Arc::clone(queue), batch));
                    break;
                }
                Poll::WaitUntil(deadline) => {
                    earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                }
                Poll::Idle => {}
            }
        }
        drop(queues);

        if let Some((queue, batch)) = work {
            queue.run_batch(batch);
            shared.notify();
            continue;
        }

        let mut state = shared.state.lock();
        if state.generation != generation {
            continue;
        }
        match earliest {
            Some(deadline) => {
                shared.work_available.wait_until(&mut state, deadline);
            }
            None => shared.work_available.wait(&mut state),
        }
    }
}

/// Handle to one queue on a [`SharedBatchScheduler`].
///
/// Dropping the handle flushes the queue: remaining batches are executed
/// without waiting for their timeouts and the queue is then removed.
pub struct BatchQueue<T: BatchTask> {
    core: Arc<QueueCore<T>>,
    shared: Arc<SchedulerShared<T>>,
}

impl<T: BatchTask> BatchQueue<T> {
    /// Admit `task` into the queue.
    ///
    /// Fails with `InvalidArgument` for zero-size tasks or tasks larger than
    /// `max_batch_size` when splitting is disabled, and with `Unavailable`
    /// when the queue has no room.
    pub fn schedule(&self, task: T) -> Result<()> {
        let options = &self.core.options;
        let size = task.size();
        if size == 0 {
            return Err(Error::invalid_argument("Task size must be positive"));
        }
        if size > options.max_batch_size && !options.enable_large_batch_splitting {
            return Err(Error::invalid_argument(format!(
                "Task size {} is larger than maximum batch size {}",
                size, options.max_batch_size
            )));
        }

        {
            let mut state = self.core.state.lock();
            if state.stopped {
                return Err(Error::unavailable("Batch scheduler is shutting down"));
            }
            let admissible = if options.enable_large_batch_splitting {
                size <= state.scheduling_capacity(options)
            } else {
                size <= state.open_batch_remaining(options.max_batch_size)
                    || state.new_batches_allowed(options.max_enqueued_batches) > 0
            };
            if !admissible {
                return Err(Error::unavailable(
                    "The batch scheduling queue to which this task was submitted is full",
                ));
            }
            state.enqueue(task, options)?;
        }

        self.shared.notify();
        Ok(())
    }

    /// Tasks waiting in closed or open batches (not counting the executing
    /// batch)
    pub fn num_enqueued_tasks(&self) -> usize {
        self.core.state.lock().num_enqueued_tasks()
    }

    /// Total task size the queue could still admit
    pub fn scheduling_capacity(&self) -> usize {
        self.core.state.lock().scheduling_capacity(&self.core.options)
    }

    /// Remove tasks matching `pred` from the open batch. Tasks in closed
    /// batches are unaffected.
    pub fn cancel_where<F>(&self, pred: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        cancel_in_open_batch(&self.core, pred)
    }

    /// Weak handle usable for cancellation without keeping the queue alive
    pub fn downgrade(&self) -> WeakBatchQueue<T> {
        WeakBatchQueue {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Options this queue was created with
    pub fn options(&self) -> &QueueOptions<T> {
        &self.core.options
    }
}

impl<T: BatchTask> Drop for BatchQueue<T> {
    fn drop(&mut self) {
        self.core.state.lock().closing = true;
        self.shared.notify();
    }
}

/// Non-owning queue reference
pub struct WeakBatchQueue<T> {
    core: Weak<QueueCore<T>>,
}

impl<T: BatchTask> WeakBatchQueue<T> {
    /// Like [`BatchQueue::cancel_where`]; a no-op once the queue is gone
    pub fn cancel_where<F>(&self, pred: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        match self.core.upgrade() {
            Some(core) => cancel_in_open_batch(&core, pred),
            None => 0,
        }
    }
}

impl<T> Clone for WeakBatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            core: Weak::clone(&self.core),
        }
    }
}

fn cancel_in_open_batch<T: BatchTask, F>(core: &QueueCore<T>, pred: F) -> usize
where
    F: FnMut(&T) -> bool,
{
    let mut state = core.state.lock();
    match state.open_batch() {
        Some(open) => open.remove_where(pred),
        None => 0,
    }
}
