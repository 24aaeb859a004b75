//! One execution attempt of a background load.

use std::{
  any::Any,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::LoaderKey;
use crate::{
  error::LoadError,
  scheduler::{Message, Scheduler, TimerId},
};

/// The work a [`ThrottledLoader`](super::ThrottledLoader) runs off the owner
/// thread.
///
/// Closures of the form `Fn(&CancellationToken) -> Result<D, LoadError>`
/// implement this trait directly.
pub trait LoadInBackground<D>: Send + Sync + 'static {
  /// Produce a result. Called on an executor thread; should check `cancel`
  /// periodically and bail out early once it is cancelled.
  fn load_in_background(&self, cancel: &CancellationToken) -> Result<D, LoadError>;

  /// Called on the owner thread right after a running load was cancelled.
  fn cancel_load_in_background(&self) {}

  /// Called on the owner thread with a result that will not be delivered, so
  /// resources held by it can be released.
  fn on_canceled(&self, _data: Option<D>) {}
}

impl<D, F> LoadInBackground<D> for F
where
  F: Fn(&CancellationToken) -> Result<D, LoadError> + Send + Sync + 'static,
{
  fn load_in_background(&self, cancel: &CancellationToken) -> Result<D, LoadError> {
    self(cancel)
  }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one [`LoadTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
  pub(crate) fn next() -> Self {
    Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskStatus {
  Pending,
  Running,
  Finished,
}

/// A single background execution attempt.
///
/// Never reused: once its outcome has been dispatched the task is dropped.
#[derive(Debug)]
pub(crate) struct LoadTask {
  id: TaskId,
  token: CancellationToken,
  status: TaskStatus,
  /// Throttled: waiting for `timer` instead of running.
  pub waiting: bool,
  pub timer: Option<TimerId>,
}

impl LoadTask {
  pub fn new() -> Self {
    Self {
      id: TaskId::next(),
      token: CancellationToken::new(),
      status: TaskStatus::Pending,
      waiting: false,
      timer: None,
    }
  }

  pub fn id(&self) -> TaskId {
    self.id
  }

  pub fn status(&self) -> TaskStatus {
    self.status
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Submit the work to the scheduler's executor.
  ///
  /// Errors and panics in the work are caught here and reported like any
  /// other outcome.
  pub fn execute<D: Send + 'static>(
    &mut self,
    loader: LoaderKey,
    work: Arc<dyn LoadInBackground<D>>,
    scheduler: &mut Scheduler<D>,
  ) {
    self.status = TaskStatus::Running;
    let task = self.id;
    let token = self.token.clone();
    let sender = scheduler.sender();

    scheduler.spawn(Box::new(move || {
      let outcome = if token.is_cancelled() {
        Err(LoadError::Cancelled)
      } else {
        match catch_unwind(AssertUnwindSafe(|| work.load_in_background(&token))) {
          Ok(outcome) => outcome,
          Err(payload) => {
            let message = panic_message(payload);
            warn!(?task, %message, "Background load panicked");
            Err(LoadError::Panicked(message))
          }
        }
      };

      if !sender.post(Message::TaskFinished { loader, task, outcome }) {
        trace!(?task, "Owner gone, dropping task outcome");
      }
    }));
  }

  /// Request cooperative cancellation.
  ///
  /// Refused once the task has finished or was already cancelled.
  pub fn cancel(&mut self) -> bool {
    if self.status == TaskStatus::Finished || self.is_cancelled() {
      return false;
    }
    self.token.cancel();
    true
  }

  pub fn finish(&mut self) {
    self.status = TaskStatus::Finished;
  }
}

impl std::fmt::Display for LoadTask {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "LoadTask({:?}, {:?}", self.id, self.status)?;
    if self.waiting {
      write!(f, ", waiting")?;
    }
    if self.is_cancelled() {
      write!(f, ", cancelled")?;
    }
    write!(f, ")")
  }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
