use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Error};
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::Semaphore;

/// Unit of work handed to the worker pool.
///
/// `process` runs on an arbitrary worker thread, with no synchronization beyond what the
/// implementation itself provides. It must not block indefinitely.
pub trait Task: Send + Sync + 'static {
    /// Process the task.
    fn process(&self);
}

/// Bounded FIFO of task references, shared between producers and workers.
pub struct DispatchQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    queue: Mutex<VecDeque<Arc<T>>>,
    pending: Semaphore,
    max_depth: usize,
    stopping: AtomicBool,
}

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> DispatchQueue<T>
where
    T: Task,
{
    /// Create a queue that holds at most `max_depth` pending tasks.
    pub fn new(max_depth: usize) -> Self {
        let shared = Shared {
            queue: Mutex::new(VecDeque::with_capacity(max_depth.min(1024))),
            pending: Semaphore::new(0),
            max_depth,
            stopping: AtomicBool::new(false),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Append a task to the back of the queue.
    ///
    /// Never blocks. Fails if the queue already holds `max_depth` tasks, leaving the existing
    /// contents untouched.
    pub fn submit(&self, task: Arc<T>) -> Result<(), SubmitError> {
        if self.is_stopping() {
            return Err(SubmitError::Stopped);
        }

        let mut queue = self.lock();
        if queue.len() >= self.shared.max_depth {
            event!(Level::TRACE, depth = queue.len(), "dispatch queue full");
            return Err(SubmitError::Full);
        }

        queue.push_back(task);
        drop(queue);

        self.shared.pending.post();

        Ok(())
    }

    /// Number of tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no tasks are waiting.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of pending tasks.
    pub fn max_depth(&self) -> usize {
        self.shared.max_depth
    }

    /// Returns true once the queue has been told to stop.
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Wait for a pending task and pop it.
    ///
    /// Returns `None` on a wakeup that found the queue empty, or when stopping.
    fn next(&self) -> Option<Arc<T>> {
        self.shared.pending.wait();

        if self.is_stopping() {
            return None;
        }

        self.lock().pop_front()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<T>>> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self, workers: usize) {
        self.shared.stopping.store(true, Ordering::Release);

        // Wake every worker so it can observe the stop flag
        for _ in 0..workers {
            self.shared.pending.post();
        }
    }
}

/// Fixed set of worker threads draining a `DispatchQueue`.
///
/// Dropping the pool stops and joins all workers. Tasks still queued at that point are not
/// guaranteed to run.
pub struct WorkerPool<T>
where
    T: Task,
{
    queue: DispatchQueue<T>,
    workers: Vec<JoinHandle<()>>,
}

impl<T> WorkerPool<T>
where
    T: Task,
{
    /// Start `count` worker threads processing tasks from `queue`.
    #[instrument("WorkerPool::start", skip_all)]
    pub fn start(count: usize, queue: DispatchQueue<T>) -> Result<Self, StartError> {
        if count == 0 {
            return Err(anyhow!("worker count must be greater than zero").into());
        }
        if queue.max_depth() == 0 {
            return Err(anyhow!("queue depth must be greater than zero").into());
        }

        event!(Level::DEBUG, count, max_depth = queue.max_depth(), "starting workers");

        // Build up incrementally, so a failed spawn still joins the started workers on drop
        let mut pool = Self {
            queue,
            workers: Vec::with_capacity(count),
        };

        for index in 0..count {
            let queue = pool.queue.clone();
            let handle = thread::Builder::new()
                .name(format!("keel-worker-{}", index))
                .spawn(move || run_worker(queue))
                .context("failed to spawn worker thread")?;
            pool.workers.push(handle);
        }

        Ok(pool)
    }

    /// The queue this pool drains.
    pub fn queue(&self) -> &DispatchQueue<T> {
        &self.queue
    }

    /// Number of running worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop all workers after their current task, and wait for them to exit.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl<T> Drop for WorkerPool<T>
where
    T: Task,
{
    fn drop(&mut self) {
        event!(Level::DEBUG, "stopping workers");

        self.queue.stop(self.workers.len());

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                event!(Level::ERROR, "worker thread panicked");
            }
        }
    }
}

fn run_worker<T>(queue: DispatchQueue<T>)
where
    T: Task,
{
    event!(Level::TRACE, "worker started");

    while !queue.is_stopping() {
        let Some(task) = queue.next() else { continue };
        task.process();
    }

    event!(Level::TRACE, "worker stopped");
}

/// Failed to submit a task.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is at its maximum depth.
    #[error("dispatch queue is full")]
    Full,

    /// The queue is shutting down.
    #[error("dispatch queue is stopping")]
    Stopped,
}

/// Failed to start the worker pool.
#[derive(Error, Debug)]
#[error("failed to start worker pool")]
pub struct StartError {
    #[from]
    source: Error,
}
