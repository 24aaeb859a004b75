//! Loader behavior that runs a background strategy with an optional throttle.
//!
//! # Task slots
//!
//! At most two tasks exist per loader:
//!
//! - `task`: the current request. Either waiting on a throttle timer, running,
//!   or blocked until the cancelling task reports back.
//! - `cancelling`: a task whose cancellation was accepted but which has not
//!   reported yet. While it is set no new task starts.
//!
//! # Dispatch rules
//!
//! - a result from a task that is not `task` is handled as a cancellation
//! - a cancellation from `cancelling` frees the slot, rolls back the content
//!   change, delivers a cancellation and starts the blocked task
//! - a result for an abandoned loader goes to `on_canceled` instead of the
//!   listener
//! - a failed or panicked load is logged and handled like a cancellation

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, warn};

use super::{LoadInBackground, LoadTask, Loader, LoaderBehavior, LoaderContext, LoaderId, LoaderKey, LoaderState, TaskId};
use crate::{error::LoadError, loader::task::TaskStatus};

/// Minimum spacing between the completion of one load and the start of the
/// next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Throttle {
  min_interval: Duration,
}

impl Throttle {
  pub fn new(min_interval: Duration) -> Self {
    Self { min_interval }
  }

  pub fn from_millis(ms: u64) -> Self {
    Self::new(Duration::from_millis(ms))
  }

  /// No throttling.
  pub fn none() -> Self {
    Self::default()
  }

  pub fn min_interval(&self) -> Duration {
    self.min_interval
  }

  pub fn is_enabled(&self) -> bool {
    !self.min_interval.is_zero()
  }

  /// When the next load may start, if that is later than `now`.
  pub fn ready_at(&self, last_completion: Option<Instant>, now: Instant) -> Option<Instant> {
    if !self.is_enabled() {
      return None;
    }
    let at = last_completion? + self.min_interval;
    (now < at).then_some(at)
  }
}

/// Asynchronous loader behavior with a throttle and a single-task invariant.
pub struct ThrottledLoader<D> {
  work: Arc<dyn LoadInBackground<D>>,
  throttle: Throttle,
  task: Option<LoadTask>,
  cancelling: Option<LoadTask>,
  last_load_complete: Option<Instant>,
  cached: Option<D>,
}

impl<D: Clone + Send + 'static> ThrottledLoader<D> {
  pub fn new(work: impl LoadInBackground<D>) -> Self {
    Self::from_arc(Arc::new(work))
  }

  pub fn from_arc(work: Arc<dyn LoadInBackground<D>>) -> Self {
    Self {
      work,
      throttle: Throttle::none(),
      task: None,
      cancelling: None,
      last_load_complete: None,
      cached: None,
    }
  }

  pub fn with_throttle(mut self, throttle: Throttle) -> Self {
    self.throttle = throttle;
    self
  }

  pub fn set_update_throttle(&mut self, delay: Duration) {
    self.throttle = Throttle::new(delay);
  }

  pub fn into_loader(self, id: impl Into<LoaderId>) -> Loader<D> {
    Loader::new(id, self)
  }

  /// True while a cancelled task has not reported back yet.
  pub fn is_load_in_background_canceled(&self) -> bool {
    self.cancelling.is_some()
  }

  /// Start the current task, or park it on a timer if the throttle says it
  /// is too early. Does nothing while a cancellation is outstanding.
  fn execute_pending_task(&mut self, key: LoaderKey, cx: &mut LoaderContext<'_, D>) {
    if self.cancelling.is_some() {
      return;
    }
    let Some(task) = self.task.as_mut() else {
      return;
    };
    if task.status() != TaskStatus::Pending {
      return;
    }

    // Only one delayed task may be outstanding.
    if task.waiting {
      task.waiting = false;
      if let Some(timer) = task.timer.take() {
        cx.scheduler().remove_timer(timer);
      }
    }

    if let Some(at) = self.throttle.ready_at(self.last_load_complete, Instant::now()) {
      debug!(task = %task, wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64, "Throttled, waiting");
      task.waiting = true;
      task.timer = Some(cx.scheduler().post_at(at, key, task.id()));
      return;
    }

    debug!(task = %task, "Executing");
    task.execute(key, self.work.clone(), cx.scheduler());
  }

  fn dispatch_on_cancelled(
    &mut self,
    state: &mut LoaderState,
    cx: &mut LoaderContext<'_, D>,
    task: TaskId,
    data: Option<D>,
  ) {
    self.work.on_canceled(data);
    if self.cancelling.as_ref().is_some_and(|t| t.id() == task) {
      debug!(loader_id = %state.id(), "Cancelled task is now cancelled, delivering cancellation");
      state.rollback_content_changed();
      self.last_load_complete = Some(Instant::now());
      self.cancelling = None;
      cx.deliver_cancellation(state);
      self.execute_pending_task(state.key(), cx);
    }
  }

  fn dispatch_on_load_complete(
    &mut self,
    state: &mut LoaderState,
    cx: &mut LoaderContext<'_, D>,
    task: TaskId,
    data: D,
  ) {
    if !self.task.as_ref().is_some_and(|t| t.id() == task) {
      debug!(loader_id = %state.id(), ?task, "Load complete of old task, treating as cancelled");
      self.dispatch_on_cancelled(state, cx, task, Some(data));
      return;
    }

    self.task = None;
    if state.is_abandoned() {
      self.work.on_canceled(Some(data));
      return;
    }

    state.commit_content_changed();
    self.last_load_complete = Some(Instant::now());
    self.cached = Some(data.clone());
    debug!(loader_id = %state.id(), "Delivering result");
    cx.deliver_result(state, data);
  }

  fn dispatch_on_failed(
    &mut self,
    state: &mut LoaderState,
    cx: &mut LoaderContext<'_, D>,
    task: TaskId,
    error: LoadError,
  ) {
    if !self.task.as_ref().is_some_and(|t| t.id() == task) {
      self.dispatch_on_cancelled(state, cx, task, None);
      return;
    }

    warn!(loader_id = %state.id(), %error, "Background load failed");
    self.task = None;
    self.work.on_canceled(None);
    state.rollback_content_changed();
    self.last_load_complete = Some(Instant::now());
    cx.deliver_cancellation(state);
  }
}

impl<D: Clone + Send + 'static> LoaderBehavior<D> for ThrottledLoader<D> {
  fn on_start_loading(&mut self, state: &mut LoaderState, cx: &mut LoaderContext<'_, D>) {
    if let Some(cached) = self.cached.clone() {
      cx.deliver_result(state, cached);
    }
    if state.take_content_changed() || self.cached.is_none() {
      self.on_force_load(state, cx);
    }
  }

  fn on_cancel_load(&mut self, state: &mut LoaderState, cx: &mut LoaderContext<'_, D>) -> bool {
    let Some(mut task) = self.task.take() else {
      return false;
    };
    debug!(loader_id = %state.id(), task = %task, "Cancel load");

    if self.cancelling.is_some() {
      debug!("Still waiting for cancelled task, dropping next");
      if let Some(timer) = task.timer.take() {
        cx.scheduler().remove_timer(timer);
      }
      return false;
    }

    if task.waiting {
      debug!("Task is waiting, dropping it");
      if let Some(timer) = task.timer.take() {
        cx.scheduler().remove_timer(timer);
      }
      return false;
    }

    let cancelled = task.cancel();
    debug!(cancelled, "Cancel requested");
    if cancelled {
      self.cancelling = Some(task);
      self.work.cancel_load_in_background();
    }
    cancelled
  }

  fn on_force_load(&mut self, state: &mut LoaderState, cx: &mut LoaderContext<'_, D>) {
    self.on_cancel_load(state, cx);
    let task = LoadTask::new();
    debug!(loader_id = %state.id(), task = %task, "Preparing load");
    self.task = Some(task);
    self.execute_pending_task(state.key(), cx);
  }

  fn on_reset(&mut self, state: &mut LoaderState, cx: &mut LoaderContext<'_, D>) {
    self.on_cancel_load(state, cx);
    if let Some(cached) = self.cached.take() {
      self.work.on_canceled(Some(cached));
    }
  }

  fn on_task_finished(
    &mut self,
    state: &mut LoaderState,
    cx: &mut LoaderContext<'_, D>,
    task: TaskId,
    outcome: Result<D, LoadError>,
  ) {
    for slot in [self.task.as_mut(), self.cancelling.as_mut()].into_iter().flatten() {
      if slot.id() == task {
        slot.finish();
      }
    }
    let cancelled = self.cancelling.as_ref().is_some_and(|t| t.id() == task);

    match outcome {
      Ok(data) if !cancelled => self.dispatch_on_load_complete(state, cx, task, data),
      Ok(data) => self.dispatch_on_cancelled(state, cx, task, Some(data)),
      Err(error) if cancelled => {
        debug!(%error, "Cancelled task failed");
        self.dispatch_on_cancelled(state, cx, task, None)
      }
      Err(error) => self.dispatch_on_failed(state, cx, task, error),
    }
  }

  fn on_timer(&mut self, state: &mut LoaderState, cx: &mut LoaderContext<'_, D>, task: TaskId) {
    let Some(current) = self.task.as_mut() else {
      return;
    };
    if current.id() != task || !current.waiting {
      return;
    }
    current.waiting = false;
    current.timer = None;
    self.execute_pending_task(state.key(), cx);
  }
}
