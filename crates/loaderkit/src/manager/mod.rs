//! Loader registry driven by its owner's lifecycle.

mod handle;
mod host;

#[cfg(test)]
mod __tests__;

use std::{
  collections::BTreeMap,
  rc::Rc,
  sync::{Arc, atomic::AtomicBool},
};

pub use handle::{LoaderCallbacks, LoaderHandle};
pub use host::{LoaderManagerHost, ROOT_WHO, RetainedManagers};
use tracing::{debug, trace, warn};

use crate::{
  error::LoaderError,
  executor::Executor,
  loader::{DeliveryKind, Loader, LoaderArgs, LoaderContext, LoaderId, LoaderKey, Outbox},
  observer::ContentObserver,
  scheduler::{Message, Scheduler},
};

type Handles<D> = BTreeMap<LoaderId, LoaderHandle<D>>;

/// Keyed registry of [`LoaderHandle`]s for one owner scope.
///
/// All methods run on the owner thread. Background outcomes are queued in the
/// manager's [`Scheduler`] and applied by [`dispatch_pending`](Self::dispatch_pending).
pub struct LoaderManager<D> {
  who: String,
  loaders: Handles<D>,
  inactive: Handles<D>,
  started: bool,
  retaining: bool,
  scheduler: Scheduler<D>,
  outbox: Outbox<D>,
}

impl<D: PartialEq + Send + 'static> LoaderManager<D> {
  pub fn new(who: impl Into<String>, started: bool, executor: Arc<dyn Executor>) -> Self {
    Self {
      who: who.into(),
      loaders: BTreeMap::new(),
      inactive: BTreeMap::new(),
      started,
      retaining: false,
      scheduler: Scheduler::new(executor),
      outbox: Outbox::new(),
    }
  }

  pub fn who(&self) -> &str {
    &self.who
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  pub fn is_retaining(&self) -> bool {
    self.retaining
  }

  pub fn scheduler(&self) -> &Scheduler<D> {
    &self.scheduler
  }

  /// Active handle for `id`.
  pub fn handle(&self, id: impl Into<LoaderId>) -> Option<&LoaderHandle<D>> {
    self.loaders.get(&id.into())
  }

  /// Handle kept for `id` while its replacement loads.
  pub fn inactive_handle(&self, id: impl Into<LoaderId>) -> Option<&LoaderHandle<D>> {
    self.inactive.get(&id.into())
  }

  pub fn len(&self) -> usize {
    self.loaders.len()
  }

  pub fn is_empty(&self) -> bool {
    self.loaders.is_empty()
  }

  // ==========================================================================
  // Loader operations
  // ==========================================================================

  /// Return the loader registered for `id`, creating and (if the manager is
  /// started) starting one if there is none.
  ///
  /// An existing handle picks up `callbacks`; if it already holds data and
  /// the manager is started, the data is delivered again right away.
  #[tracing::instrument(level = "trace", skip(self, args, callbacks), fields(who = %self.who))]
  pub fn init_loader(
    &mut self,
    id: LoaderId,
    args: Option<LoaderArgs>,
    callbacks: Rc<dyn LoaderCallbacks<D>>,
  ) -> Result<&Loader<D>, LoaderError> {
    debug!(args = ?args, "init_loader");
    match self.loaders.get_mut(&id) {
      Some(handle) => {
        debug!(handle = %handle, "Re-using existing loader");
        handle.set_callbacks(callbacks);
        if self.started && handle.has_data() {
          handle.call_on_load_finished();
        }
      }
      None => {
        let handle = LoaderHandle::new(id, args, callbacks)?;
        debug!(handle = %handle, "Created new loader");
        self.install(handle);
      }
    }
    self.flush();
    self.active_loader(id)
  }

  /// Replace the loader for `id` with a fresh one from `callbacks`.
  ///
  /// Data the current handle already holds is kept in the inactive slot
  /// until the new loader delivers. If the current handle has no data and an
  /// older one is already waiting in the inactive slot, the current load is
  /// cancelled and the new handle is queued behind it; the returned loader is
  /// then not started until the cancellation lands.
  ///
  /// The factory runs before anything else changes, so a factory error leaves
  /// the manager untouched.
  #[tracing::instrument(level = "trace", skip(self, args, callbacks), fields(who = %self.who))]
  pub fn restart_loader(
    &mut self,
    id: LoaderId,
    args: Option<LoaderArgs>,
    callbacks: Rc<dyn LoaderCallbacks<D>>,
  ) -> Result<&Loader<D>, LoaderError> {
    debug!(args = ?args, "restart_loader");
    let fresh = LoaderHandle::new(id, args, callbacks)?;

    let Self {
      loaders,
      inactive,
      scheduler,
      outbox,
      ..
    } = self;
    let mut cx = LoaderContext::new(scheduler, outbox);

    if let Some(mut current) = loaders.remove(&id) {
      match inactive.remove(&id) {
        Some(mut last) if current.has_data() => {
          debug!(last = %last, "Removing last inactive loader");
          last.forget_delivered();
          last.destroy(&mut cx);
          current.abandon(&mut cx);
          inactive.insert(id, current);
        }
        Some(last) => {
          inactive.insert(id, last);
          if current.cancel(&mut cx) {
            debug!(handle = %current, "Current loader is running; configuring pending loader");
            current.replace_pending(&mut cx, fresh);
            loaders.insert(id, current);
            self.flush();
            return self.loader_of(id);
          }
          debug!(handle = %current, "Current loader is stopped; replacing");
          current.destroy(&mut cx);
        }
        None => {
          debug!(handle = %current, "Making last loader inactive");
          current.abandon(&mut cx);
          inactive.insert(id, current);
        }
      }
    }

    self.install(fresh);
    self.flush();
    self.active_loader(id)
  }

  /// Destroy the active and the inactive handle for `id`.
  #[tracing::instrument(level = "trace", skip(self), fields(who = %self.who))]
  pub fn destroy_loader(&mut self, id: LoaderId) {
    debug!("destroy_loader");
    let Self {
      loaders,
      inactive,
      scheduler,
      outbox,
      ..
    } = self;
    let mut cx = LoaderContext::new(scheduler, outbox);
    if let Some(mut handle) = loaders.remove(&id) {
      handle.destroy(&mut cx);
    }
    if let Some(mut handle) = inactive.remove(&id) {
      handle.destroy(&mut cx);
    }
    self.flush();
  }

  /// The loader for `id`, or the one queued to replace it.
  pub fn get_loader(&self, id: impl Into<LoaderId>) -> Option<&Loader<D>> {
    let handle = self.loaders.get(&id.into())?;
    Some(handle.pending().unwrap_or(handle).loader())
  }

  /// An observer that forwards change notifications to the loader returned
  /// by [`get_loader`](Self::get_loader).
  pub fn content_observer(&self, id: impl Into<LoaderId>) -> Option<ContentObserver> {
    let loader = self.get_loader(id)?;
    let key = loader.key();
    let pending = Arc::new(AtomicBool::new(false));
    let flag = pending.clone();
    let sender = self.scheduler.sender();
    Some(ContentObserver::new(
      loader.id(),
      pending,
      Arc::new(move || {
        sender.post(Message::ContentChanged {
          loader: key,
          pending: flag.clone(),
        })
      }),
    ))
  }

  /// True if any active handle is started and has not delivered data yet.
  pub fn has_running_loaders(&self) -> bool {
    self.loaders.values().any(|h| h.is_started() && !h.delivered_data())
  }

  // ==========================================================================
  // Lifecycle transitions
  // ==========================================================================

  #[tracing::instrument(level = "trace", skip(self), fields(who = %self.who))]
  pub fn do_start(&mut self) -> Result<(), LoaderError> {
    if self.started {
      warn!("Called do_start when already started");
      return Err(LoaderError::invalid_state(format!("do_start when already started: {self}")));
    }
    debug!("Starting");
    self.started = true;
    self.for_each_active(|handle, cx| handle.start(cx));
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self), fields(who = %self.who))]
  pub fn do_stop(&mut self) -> Result<(), LoaderError> {
    if !self.started {
      warn!("Called do_stop when not started");
      return Err(LoaderError::invalid_state(format!("do_stop when not started: {self}")));
    }
    debug!("Stopping");
    self.for_each_active(|handle, cx| handle.stop(cx));
    self.started = false;
    Ok(())
  }

  /// Keep every loader running across a reconfiguration of the owner.
  #[tracing::instrument(level = "trace", skip(self), fields(who = %self.who))]
  pub fn do_retain(&mut self) -> Result<(), LoaderError> {
    if !self.started {
      warn!("Called do_retain when not started");
      return Err(LoaderError::invalid_state(format!("do_retain when not started: {self}")));
    }
    debug!("Retaining");
    self.retaining = true;
    self.started = false;
    self.for_each_active(|handle, _| handle.retain());
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self), fields(who = %self.who))]
  pub fn finish_retain(&mut self) {
    if !self.retaining {
      return;
    }
    debug!("Finished retaining");
    self.retaining = false;
    self.for_each_active(|handle, cx| handle.finish_retain(cx));
  }

  /// Defer redelivery of held data until [`do_report_start`](Self::do_report_start).
  pub fn do_report_next_start(&mut self) {
    for handle in self.loaders.values_mut().rev() {
      handle.set_report_next_start();
    }
  }

  pub fn do_report_start(&mut self) {
    self.for_each_active(|handle, _| handle.report_start());
  }

  /// Destroy every handle. Active handles survive while the manager is
  /// retained.
  #[tracing::instrument(level = "trace", skip(self), fields(who = %self.who))]
  pub fn do_destroy(&mut self) {
    let Self {
      loaders,
      inactive,
      scheduler,
      outbox,
      retaining,
      ..
    } = self;
    let mut cx = LoaderContext::new(scheduler, outbox);
    if !*retaining {
      debug!("Destroying active");
      for handle in loaders.values_mut().rev() {
        handle.destroy(&mut cx);
      }
      loaders.clear();
    }
    debug!("Destroying inactive");
    for handle in inactive.values_mut().rev() {
      handle.destroy(&mut cx);
    }
    inactive.clear();
    self.flush();
  }

  // ==========================================================================
  // Owner-thread dispatch
  // ==========================================================================

  /// Apply every ready background outcome, content change and timer.
  /// Returns the number of messages handled.
  pub fn dispatch_pending(&mut self) -> usize {
    let messages = self.scheduler.take_ready();
    let count = messages.len();
    for msg in messages {
      match msg {
        Message::TaskFinished { loader, task, outcome } => match self.route(loader) {
          Some((target, mut cx)) => target.dispatch_task_finished(&mut cx, task, outcome),
          None => trace!(who = %self.who, ?loader, ?task, "Loader gone, dropping task outcome"),
        },
        Message::TimerFired { loader, task } => match self.route(loader) {
          Some((target, mut cx)) => target.dispatch_timer(&mut cx, task),
          None => trace!(who = %self.who, ?loader, ?task, "Loader gone, dropping timer"),
        },
        Message::ContentChanged { loader, pending } => {
          pending.store(false, std::sync::atomic::Ordering::Release);
          match self.route(loader) {
            Some((target, mut cx)) => target.on_content_changed(&mut cx),
            None => trace!(who = %self.who, ?loader, "Loader gone, dropping content change"),
          }
        }
      }
      self.flush();
    }
    count
  }

  /// Wait until [`dispatch_pending`](Self::dispatch_pending) has something to do.
  pub async fn wait_ready(&mut self) {
    self.scheduler.wait_ready().await;
  }

  /// True when no background work, timer or message is left.
  pub fn is_idle(&mut self) -> bool {
    self.scheduler.is_idle()
  }

  /// Dispatch until [`is_idle`](Self::is_idle).
  pub async fn run_until_idle(&mut self) {
    while !self.is_idle() {
      self.wait_ready().await;
      self.dispatch_pending();
    }
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  fn active_loader(&self, id: LoaderId) -> Result<&Loader<D>, LoaderError> {
    self
      .loaders
      .get(&id)
      .map(LoaderHandle::loader)
      .ok_or_else(|| LoaderError::invalid_state(format!("Loader {id} was removed while being installed")))
  }

  fn loader_of(&self, id: LoaderId) -> Result<&Loader<D>, LoaderError> {
    self
      .get_loader(id)
      .ok_or_else(|| LoaderError::invalid_state(format!("Loader {id} was removed while being installed")))
  }

  fn install(&mut self, handle: LoaderHandle<D>) {
    let Self {
      loaders,
      scheduler,
      outbox,
      started,
      ..
    } = self;
    install_into(loaders, *started, &mut LoaderContext::new(scheduler, outbox), handle);
  }

  fn for_each_active(&mut self, mut f: impl FnMut(&mut LoaderHandle<D>, &mut LoaderContext<'_, D>)) {
    let Self {
      loaders,
      scheduler,
      outbox,
      ..
    } = self;
    let mut cx = LoaderContext::new(scheduler, outbox);
    for handle in loaders.values_mut().rev() {
      f(handle, &mut cx);
    }
    self.flush();
  }

  fn route(&mut self, key: LoaderKey) -> Option<(&mut Loader<D>, LoaderContext<'_, D>)> {
    let Self {
      loaders,
      inactive,
      scheduler,
      outbox,
      ..
    } = self;
    let loader = loaders
      .values_mut()
      .chain(inactive.values_mut())
      .find_map(|h| h.find_loader_mut(key))?;
    Some((loader, LoaderContext::new(scheduler, outbox)))
  }

  /// Route queued deliveries to the active handle listening on each loader.
  fn flush(&mut self) {
    while let Some(delivery) = self.outbox.pop_front() {
      let Some(id) = self
        .loaders
        .iter()
        .find(|(_, h)| h.listener_key() == delivery.listener)
        .map(|(id, _)| *id)
      else {
        trace!(who = %self.who, loader = ?delivery.loader, "Ignoring delivery -- not active");
        continue;
      };
      match delivery.kind {
        DeliveryKind::Complete(data) => self.on_load_complete(id, data),
        DeliveryKind::Canceled => self.on_load_canceled(id),
      }
    }
  }

  fn on_load_complete(&mut self, id: LoaderId, data: D) {
    let Self {
      loaders,
      inactive,
      scheduler,
      outbox,
      started,
      ..
    } = self;
    let mut cx = LoaderContext::new(scheduler, outbox);
    let Some(handle) = loaders.get_mut(&id) else {
      return;
    };
    debug!(handle = %handle, "on_load_complete");
    if handle.is_destroyed() {
      debug!("Ignoring load complete -- destroyed");
      return;
    }

    if let Some(pending) = handle.take_pending() {
      switch_to_pending(loaders, *started, &mut cx, id, *pending);
      return;
    }

    handle.store_result(data);
    if let Some(mut last) = inactive.remove(&id) {
      last.forget_delivered();
      last.destroy(&mut cx);
    }
  }

  fn on_load_canceled(&mut self, id: LoaderId) {
    let Self {
      loaders,
      scheduler,
      outbox,
      started,
      ..
    } = self;
    let mut cx = LoaderContext::new(scheduler, outbox);
    let Some(handle) = loaders.get_mut(&id) else {
      return;
    };
    debug!(handle = %handle, "on_load_canceled");
    if handle.is_destroyed() {
      debug!("Ignoring load canceled -- destroyed");
      return;
    }
    if let Some(pending) = handle.take_pending() {
      switch_to_pending(loaders, *started, &mut cx, id, *pending);
    }
  }
}

fn install_into<D: PartialEq + Send + 'static>(
  loaders: &mut Handles<D>,
  started: bool,
  cx: &mut LoaderContext<'_, D>,
  handle: LoaderHandle<D>,
) {
  let id = handle.id();
  loaders.insert(id, handle);
  if started && let Some(handle) = loaders.get_mut(&id) {
    handle.start(cx);
  }
}

/// Tear down the active handle for `id` and let `pending` take its place.
fn switch_to_pending<D: PartialEq + Send + 'static>(
  loaders: &mut Handles<D>,
  started: bool,
  cx: &mut LoaderContext<'_, D>,
  id: LoaderId,
  pending: LoaderHandle<D>,
) {
  debug!(pending = %pending, "Switching to pending loader");
  if let Some(mut old) = loaders.remove(&id) {
    old.destroy(cx);
  }
  install_into(loaders, started, cx, pending);
}

impl<D> std::fmt::Display for LoaderManager<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "LoaderManager{{who={}}}", self.who)
  }
}

impl<D> std::fmt::Debug for LoaderManager<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LoaderManager")
      .field("who", &self.who)
      .field("active", &self.loaders.keys().collect::<Vec<_>>())
      .field("inactive", &self.inactive.keys().collect::<Vec<_>>())
      .field("started", &self.started)
      .field("retaining", &self.retaining)
      .finish()
  }
}
