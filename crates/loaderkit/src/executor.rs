//! Background execution resources.
//!
//! An [`Executor`] accepts a unit of work and runs it somewhere off the owner
//! thread. Pool sizing and fairness are the executor's concern; loaders only
//! rely on the job eventually running (or being dropped on shutdown).

#[cfg(any(test, feature = "test-utils"))]
use std::{collections::VecDeque, sync::Mutex};

use tokio::runtime::Handle;
#[cfg(any(test, feature = "test-utils"))]
use tracing::trace;

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs background jobs for loaders.
pub trait Executor: Send + Sync + 'static {
  /// Submit a job for execution.
  fn execute(&self, job: Job);
}

/// Executor backed by the tokio blocking thread pool.
///
/// Loads are usually blocking I/O or CPU work, so they go to
/// `spawn_blocking` rather than the async worker threads.
#[derive(Debug, Clone)]
pub struct BlockingPoolExecutor {
  handle: Handle,
}

impl BlockingPoolExecutor {
  pub fn new(handle: Handle) -> Self {
    Self { handle }
  }

  /// Create an executor on the current tokio runtime.
  ///
  /// # Panics
  ///
  /// Panics when called outside a tokio runtime.
  pub fn current() -> Self {
    Self::new(Handle::current())
  }
}

impl Executor for BlockingPoolExecutor {
  fn execute(&self, job: Job) {
    // Detached: the job reports its own outcome through the scheduler.
    let _ = self.handle.spawn_blocking(job);
  }
}

/// Executor that runs each job immediately on the calling thread.
///
/// Outcomes still travel through the scheduler, so they are only applied on
/// the next dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
  fn execute(&self, job: Job) {
    job();
  }
}

/// Executor that queues jobs until the test runs them explicitly.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct ManualExecutor {
  queue: Mutex<VecDeque<Job>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of queued jobs.
  pub fn pending(&self) -> usize {
    self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Run the oldest queued job. Returns false if the queue was empty.
  pub fn run_next(&self) -> bool {
    let job = self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
    match job {
      Some(job) => {
        job();
        true
      }
      None => false,
    }
  }

  /// Run queued jobs until the queue is empty. Returns how many ran.
  pub fn run_all(&self) -> usize {
    let mut ran = 0;
    while self.run_next() {
      ran += 1;
    }
    ran
  }
}

#[cfg(any(test, feature = "test-utils"))]
impl Executor for ManualExecutor {
  fn execute(&self, job: Job) {
    let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
    queue.push_back(job);
    trace!(queued = queue.len(), "Job queued");
  }
}
