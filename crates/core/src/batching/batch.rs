//! Batches of tasks awaiting joint execution

use std::time::Instant;

/// A unit of work that occupies `size()` slots of a batch
pub trait BatchTask: Send + 'static {
    /// Size along the batch dimension; always positive
    fn size(&self) -> usize;
}

/// Ordered collection of tasks executed together.
///
/// A batch is open while the queue may still add to it. Once closed it is
/// never modified again and is handed to exactly one execution.
pub struct Batch<T> {
    tasks: Vec<T>,
    size: usize,
    closed: bool,
    /// When the first task was added (for batch timeouts)
    created_at: Instant,
}

impl<T: BatchTask> Batch<T> {
    /// Create an empty, open batch
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            size: 0,
            closed: false,
            created_at: Instant::now(),
        }
    }

    /// Append a task to an open batch
    pub fn add_task(&mut self, task: T) {
        debug_assert!(!self.closed, "cannot add to a closed batch");
        if self.tasks.is_empty() {
            self.created_at = Instant::now();
        }
        self.size += task.size();
        self.tasks.push(task);
    }

    /// Remove every task matching `pred` from an open batch, returning how
    /// many were removed. Closed batches are left untouched.
    pub fn remove_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        if self.closed {
            return 0;
        }
        let before = self.tasks.len();
        self.tasks.retain(|t| !pred(t));
        self.size = self.tasks.iter().map(BatchTask::size).sum();
        before - self.tasks.len()
    }

    /// Total size of all tasks
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// True when the batch holds no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Mark the batch immutable
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether the batch has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// When the batch received its first task
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Borrow the tasks in arrival order
    pub fn tasks(&self) -> &[T] {
        &self.tasks
    }

    /// Take ownership of the tasks in arrival order
    pub fn into_tasks(self) -> Vec<T> {
        self.tasks
    }
}

impl<T: BatchTask> Default for Batch<T> {
    fn default() -> Self {
        Self::new()
    }
}
