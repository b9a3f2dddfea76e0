//! Background function runner with deterministic teardown

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Runs a closure on a dedicated thread, either once or on a fixed period.
///
/// Dropping the handle signals the thread and joins it, so once `drop`
/// returns the closure is guaranteed not to be running and will never run
/// again.
pub struct PeriodicFunction {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl PeriodicFunction {
    /// Call `f` immediately and then every `interval` (measured start to
    /// start) until dropped
    pub fn periodic<F>(name: impl Into<String>, interval: Duration, f: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || loop {
            let started = Instant::now();
            f();
            let wait = interval.saturating_sub(started.elapsed());
            match stop_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                // Explicit stop or sender dropped
                _ => break,
            }
        })?;
        tracing::debug!("Started periodic function {} every {:?}", name, interval);
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
            name,
        })
    }

    /// Call `f` exactly once on a background thread
    pub fn once<F>(name: impl Into<String>, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new().name(name.clone()).spawn(f)?;
        Ok(Self {
            stop: None,
            handle: Some(handle),
            name,
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PeriodicFunction {
    fn drop(&mut self) {
        // Dropping the sender wakes the runner out of recv_timeout.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped from inside the closure itself; joining would deadlock.
                tracing::warn!("{} dropped from its own thread; detaching", self.name);
                return;
            }
            if handle.join().is_err() {
                tracing::error!("{} panicked", self.name);
            }
        }
    }
}
