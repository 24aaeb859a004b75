//! Loaders: resettable units of asynchronous work.
//!
//! A [`Loader`] is split in two:
//!
//! - [`LoaderState`], the lifecycle record (started, reset, abandoned, pending
//!   content change, registered listener) that every loader shares
//! - a [`LoaderBehavior`] strategy that decides what starting, stopping,
//!   cancelling and force-loading actually do
//!
//! Results never go straight to a listener. [`LoaderContext::deliver_result`]
//! queues them in the manager's outbox, which routes them to the handle that
//! registered as the loader's listener once the current operation returns.

mod args;
mod task;
mod throttled;

use std::{
  collections::VecDeque,
  sync::atomic::{AtomicU64, Ordering},
};

pub use args::LoaderArgs;
use serde::{Deserialize, Serialize};
pub(crate) use task::{LoadTask, panic_message};
pub use task::{LoadInBackground, TaskId};
pub use throttled::{Throttle, ThrottledLoader};
use tracing::{debug, trace};

use crate::{
  error::{LoadError, LoaderError},
  scheduler::Scheduler,
};

// ============================================================================
// Identity
// ============================================================================

/// Caller-chosen identity of a loader inside one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoaderId(pub u32);

impl std::fmt::Display for LoaderId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<u32> for LoaderId {
  fn from(id: u32) -> Self {
    Self(id)
  }
}

static NEXT_LOADER_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique key of one loader instance.
///
/// Two loaders created for the same [`LoaderId`] (for example across a
/// restart) always have different keys, so messages for a replaced loader can
/// never reach its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoaderKey(u64);

impl LoaderKey {
  pub(crate) fn next() -> Self {
    Self(NEXT_LOADER_KEY.fetch_add(1, Ordering::Relaxed))
  }
}

/// Key a handle registers with when it listens to a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerKey(u64);

impl ListenerKey {
  pub(crate) fn next() -> Self {
    Self(NEXT_LISTENER_KEY.fetch_add(1, Ordering::Relaxed))
  }
}

// ============================================================================
// Deliveries
// ============================================================================

pub(crate) enum DeliveryKind<D> {
  Complete(D),
  Canceled,
}

/// A result or cancellation waiting to be routed to its listener.
pub(crate) struct Delivery<D> {
  pub listener: ListenerKey,
  pub loader: LoaderKey,
  pub kind: DeliveryKind<D>,
}

pub(crate) type Outbox<D> = VecDeque<Delivery<D>>;

/// What a loader operation may touch besides the loader itself.
pub struct LoaderContext<'a, D> {
  scheduler: &'a mut Scheduler<D>,
  outbox: &'a mut Outbox<D>,
}

impl<'a, D: Send + 'static> LoaderContext<'a, D> {
  pub(crate) fn new(scheduler: &'a mut Scheduler<D>, outbox: &'a mut Outbox<D>) -> Self {
    Self { scheduler, outbox }
  }

  pub fn scheduler(&mut self) -> &mut Scheduler<D> {
    self.scheduler
  }

  /// Queue `data` for the loader's listener. Dropped if nobody listens.
  pub fn deliver_result(&mut self, state: &LoaderState, data: D) {
    match state.listener {
      Some(listener) => self.outbox.push_back(Delivery {
        listener,
        loader: state.key,
        kind: DeliveryKind::Complete(data),
      }),
      None => trace!(loader_id = %state.id, "No listener registered, dropping result"),
    }
  }

  /// Queue a cancellation notice for the loader's listener.
  pub fn deliver_cancellation(&mut self, state: &LoaderState) {
    match state.listener {
      Some(listener) => self.outbox.push_back(Delivery {
        listener,
        loader: state.key,
        kind: DeliveryKind::Canceled,
      }),
      None => trace!(loader_id = %state.id, "No listener registered, dropping cancellation"),
    }
  }
}

// ============================================================================
// State record
// ============================================================================

/// Lifecycle flags shared by every loader.
#[derive(Debug)]
pub struct LoaderState {
  id: LoaderId,
  key: LoaderKey,
  started: bool,
  abandoned: bool,
  reset: bool,
  content_changed: bool,
  processing_change: bool,
  listener: Option<ListenerKey>,
}

impl LoaderState {
  fn new(id: LoaderId) -> Self {
    Self {
      id,
      key: LoaderKey::next(),
      started: false,
      abandoned: false,
      reset: true,
      content_changed: false,
      processing_change: false,
      listener: None,
    }
  }

  pub fn id(&self) -> LoaderId {
    self.id
  }

  pub fn key(&self) -> LoaderKey {
    self.key
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  pub fn is_abandoned(&self) -> bool {
    self.abandoned
  }

  /// True until the first start, and again after [`Loader::reset`].
  pub fn is_reset(&self) -> bool {
    self.reset
  }

  pub fn has_listener(&self) -> bool {
    self.listener.is_some()
  }

  /// Read and clear the pending-change flag, remembering that a change is
  /// now being processed.
  pub fn take_content_changed(&mut self) -> bool {
    let changed = self.content_changed;
    self.content_changed = false;
    self.processing_change |= changed;
    changed
  }

  /// The change taken by [`take_content_changed`](Self::take_content_changed)
  /// has been fully loaded.
  pub fn commit_content_changed(&mut self) {
    self.processing_change = false;
  }

  /// The load processing a change was cancelled; mark the change pending
  /// again so the next start reloads.
  pub fn rollback_content_changed(&mut self) {
    if self.processing_change {
      self.content_changed = true;
    }
  }
}

// ============================================================================
// Behavior
// ============================================================================

/// The capability interface behind a [`Loader`].
///
/// Every hook has a no-op default. The base flags in [`LoaderState`] are
/// updated by [`Loader`] before the hook runs.
pub trait LoaderBehavior<D>: 'static {
  /// Begin loading. Usually delivers a cached result and/or forces a load.
  fn on_start_loading(&mut self, _state: &mut LoaderState, _cx: &mut LoaderContext<'_, D>) {}

  /// Stop loading. Must not cancel work that is already running.
  fn on_stop_loading(&mut self, _state: &mut LoaderState, _cx: &mut LoaderContext<'_, D>) {}

  /// Attempt to cancel the current load. Returns whether cancellation was
  /// accepted; the outcome is reported later as a cancellation delivery.
  fn on_cancel_load(&mut self, _state: &mut LoaderState, _cx: &mut LoaderContext<'_, D>) -> bool {
    false
  }

  /// Discard any cached result and load fresh data.
  fn on_force_load(&mut self, _state: &mut LoaderState, _cx: &mut LoaderContext<'_, D>) {}

  /// The loader has been abandoned in favor of a newer one.
  fn on_abandon(&mut self, _state: &mut LoaderState, _cx: &mut LoaderContext<'_, D>) {}

  /// Release everything; the loader may be started again afterwards.
  fn on_reset(&mut self, _state: &mut LoaderState, _cx: &mut LoaderContext<'_, D>) {}

  /// A background task submitted by this behavior has returned.
  fn on_task_finished(
    &mut self,
    state: &mut LoaderState,
    _cx: &mut LoaderContext<'_, D>,
    task: TaskId,
    _outcome: Result<D, LoadError>,
  ) {
    trace!(loader_id = %state.id(), ?task, "Ignoring task outcome");
  }

  /// A timer scheduled by this behavior has fired.
  fn on_timer(&mut self, _state: &mut LoaderState, _cx: &mut LoaderContext<'_, D>, _task: TaskId) {}
}

// ============================================================================
// Loader
// ============================================================================

/// A resettable unit of asynchronous work producing at most one live result.
pub struct Loader<D> {
  state: LoaderState,
  behavior: Box<dyn LoaderBehavior<D>>,
}

impl<D: Send + 'static> Loader<D> {
  pub fn new(id: impl Into<LoaderId>, behavior: impl LoaderBehavior<D>) -> Self {
    Self {
      state: LoaderState::new(id.into()),
      behavior: Box::new(behavior),
    }
  }

  pub fn id(&self) -> LoaderId {
    self.state.id
  }

  pub fn key(&self) -> LoaderKey {
    self.state.key
  }

  pub fn state(&self) -> &LoaderState {
    &self.state
  }

  pub fn state_mut(&mut self) -> &mut LoaderState {
    &mut self.state
  }

  pub fn is_started(&self) -> bool {
    self.state.started
  }

  pub fn is_abandoned(&self) -> bool {
    self.state.abandoned
  }

  pub fn is_reset(&self) -> bool {
    self.state.reset
  }

  pub fn start_loading(&mut self, cx: &mut LoaderContext<'_, D>) {
    self.state.started = true;
    self.state.reset = false;
    self.state.abandoned = false;
    self.behavior.on_start_loading(&mut self.state, cx);
  }

  pub fn stop_loading(&mut self, cx: &mut LoaderContext<'_, D>) {
    self.state.started = false;
    self.behavior.on_stop_loading(&mut self.state, cx);
  }

  pub fn cancel_load(&mut self, cx: &mut LoaderContext<'_, D>) -> bool {
    self.behavior.on_cancel_load(&mut self.state, cx)
  }

  pub fn force_load(&mut self, cx: &mut LoaderContext<'_, D>) {
    self.behavior.on_force_load(&mut self.state, cx);
  }

  pub fn abandon(&mut self, cx: &mut LoaderContext<'_, D>) {
    self.state.abandoned = true;
    self.behavior.on_abandon(&mut self.state, cx);
  }

  pub fn reset(&mut self, cx: &mut LoaderContext<'_, D>) {
    self.behavior.on_reset(&mut self.state, cx);
    self.state.reset = true;
    self.state.started = false;
    self.state.abandoned = false;
    self.state.content_changed = false;
    self.state.processing_change = false;
  }

  /// Content behind the loader changed: reload now if started, otherwise
  /// remember it for the next start.
  pub fn on_content_changed(&mut self, cx: &mut LoaderContext<'_, D>) {
    if self.state.started {
      self.force_load(cx);
    } else {
      self.state.content_changed = true;
    }
  }

  pub(crate) fn register_listener(&mut self, id: LoaderId, listener: ListenerKey) -> Result<(), LoaderError> {
    if self.state.listener.is_some() {
      return Err(LoaderError::invalid_state("There is already a listener registered"));
    }
    self.state.listener = Some(listener);
    self.state.id = id;
    Ok(())
  }

  pub(crate) fn unregister_listener(&mut self, listener: ListenerKey) -> Result<(), LoaderError> {
    match self.state.listener {
      None => Err(LoaderError::invalid_state("No listener registered")),
      Some(current) if current != listener => Err(LoaderError::invalid_argument(
        "Attempting to unregister the wrong listener",
      )),
      Some(_) => {
        self.state.listener = None;
        Ok(())
      }
    }
  }

  pub(crate) fn dispatch_task_finished(
    &mut self,
    cx: &mut LoaderContext<'_, D>,
    task: TaskId,
    outcome: Result<D, LoadError>,
  ) {
    debug!(loader_id = %self.state.id, ?task, ok = outcome.is_ok(), "Task finished");
    self.behavior.on_task_finished(&mut self.state, cx, task, outcome);
  }

  pub(crate) fn dispatch_timer(&mut self, cx: &mut LoaderContext<'_, D>, task: TaskId) {
    self.behavior.on_timer(&mut self.state, cx, task);
  }
}

impl<D> std::fmt::Display for Loader<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Loader(id={})", self.state.id)
  }
}

impl<D> std::fmt::Debug for Loader<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Loader").field("state", &self.state).finish_non_exhaustive()
  }
}
