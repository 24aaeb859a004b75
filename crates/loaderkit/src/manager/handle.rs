use std::{
  panic::{AssertUnwindSafe, catch_unwind},
  rc::Rc,
};

use tracing::{debug, error, warn};

use crate::{
  error::LoaderError,
  loader::{ListenerKey, Loader, LoaderArgs, LoaderContext, LoaderId, LoaderKey, panic_message},
};

/// Factory and consumer callbacks for one loader id.
///
/// Only ever called on the owner thread. Panics from the consumer callbacks
/// are caught and logged; the manager stays usable.
pub trait LoaderCallbacks<D> {
  /// Create the loader for `id`. Called once per handle.
  fn on_create_loader(&self, id: LoaderId, args: Option<&LoaderArgs>) -> Result<Loader<D>, LoaderError>;

  /// A loader delivered data. Called at most once per distinct result, plus
  /// redeliveries when a retained or re-initialized handle resumes.
  fn on_load_finished(&self, loader: &Loader<D>, data: &D);

  /// Previously delivered data is being discarded.
  fn on_loader_reset(&self, loader: &Loader<D>);
}

/// Binding of one [`Loader`] to an id inside a manager.
///
/// Tracks the data delivered so far, the retain state across a
/// reconfiguration and an optional pending replacement that takes over the id
/// once the current load settles.
pub struct LoaderHandle<D> {
  id: LoaderId,
  key: ListenerKey,
  args: Option<LoaderArgs>,
  callbacks: Option<Rc<dyn LoaderCallbacks<D>>>,
  loader: Loader<D>,
  have_data: bool,
  data: Option<D>,
  delivered_data: bool,
  started: bool,
  retaining: bool,
  retaining_started: bool,
  report_next_start: bool,
  destroyed: bool,
  listener_registered: bool,
  pending: Option<Box<LoaderHandle<D>>>,
}

impl<D: PartialEq + Send + 'static> LoaderHandle<D> {
  /// Create a handle and its loader through the factory.
  pub(crate) fn new(
    id: LoaderId,
    args: Option<LoaderArgs>,
    callbacks: Rc<dyn LoaderCallbacks<D>>,
  ) -> Result<Self, LoaderError> {
    let loader = callbacks.on_create_loader(id, args.as_ref())?;
    Ok(Self {
      id,
      key: ListenerKey::next(),
      args,
      callbacks: Some(callbacks),
      loader,
      have_data: false,
      data: None,
      delivered_data: false,
      started: false,
      retaining: false,
      retaining_started: false,
      report_next_start: false,
      destroyed: false,
      listener_registered: false,
      pending: None,
    })
  }

  pub fn id(&self) -> LoaderId {
    self.id
  }

  pub fn args(&self) -> Option<&LoaderArgs> {
    self.args.as_ref()
  }

  pub fn loader(&self) -> &Loader<D> {
    &self.loader
  }

  pub fn data(&self) -> Option<&D> {
    self.data.as_ref()
  }

  pub fn has_data(&self) -> bool {
    self.have_data
  }

  pub fn delivered_data(&self) -> bool {
    self.delivered_data
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  pub fn is_retaining(&self) -> bool {
    self.retaining
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed
  }

  pub fn is_listener_registered(&self) -> bool {
    self.listener_registered
  }

  pub fn pending(&self) -> Option<&LoaderHandle<D>> {
    self.pending.as_deref()
  }

  pub(crate) fn listener_key(&self) -> ListenerKey {
    self.key
  }

  pub(crate) fn set_callbacks(&mut self, callbacks: Rc<dyn LoaderCallbacks<D>>) {
    self.callbacks = Some(callbacks);
  }

  pub(crate) fn set_report_next_start(&mut self) {
    self.report_next_start = true;
  }

  pub(crate) fn take_pending(&mut self) -> Option<Box<LoaderHandle<D>>> {
    self.pending.take()
  }

  /// Queue `pending` to take over the id once this handle's load settles.
  /// An earlier pending handle is destroyed.
  pub(crate) fn replace_pending(&mut self, cx: &mut LoaderContext<'_, D>, pending: LoaderHandle<D>) {
    if let Some(mut old) = self.pending.take() {
      debug!(pending = %old, "Removing pending loader");
      old.destroy(cx);
    }
    debug!(pending = %pending, "Enqueuing as new pending loader");
    self.pending = Some(Box::new(pending));
  }

  /// Data discarded along with this handle will not be reported as reset.
  pub(crate) fn forget_delivered(&mut self) {
    self.delivered_data = false;
  }

  /// Loader of this handle or of a queued replacement, by routing key.
  pub(crate) fn find_loader_mut(&mut self, key: LoaderKey) -> Option<&mut Loader<D>> {
    if self.loader.key() == key {
      return Some(&mut self.loader);
    }
    self.pending.as_mut().and_then(|p| p.find_loader_mut(key))
  }

  pub(crate) fn start(&mut self, cx: &mut LoaderContext<'_, D>) {
    if self.retaining && self.retaining_started {
      // Resume after a reconfiguration; the loader never stopped.
      self.started = true;
      return;
    }
    if self.started {
      return;
    }
    self.started = true;
    debug!(handle = %self, "Starting");

    if !self.listener_registered {
      if let Err(error) = self.loader.register_listener(self.id, self.key) {
        warn!(handle = %self, %error, "Could not register as listener");
        return;
      }
      self.listener_registered = true;
    }
    self.loader.start_loading(cx);
  }

  pub(crate) fn stop(&mut self, cx: &mut LoaderContext<'_, D>) {
    debug!(handle = %self, "Stopping");
    self.started = false;
    if !self.retaining && self.listener_registered {
      self.listener_registered = false;
      self.unregister();
      self.loader.stop_loading(cx);
    }
  }

  pub(crate) fn retain(&mut self) {
    debug!(handle = %self, "Retaining");
    self.retaining = true;
    self.retaining_started = self.started;
    self.started = false;
    self.callbacks = None;
  }

  pub(crate) fn finish_retain(&mut self, cx: &mut LoaderContext<'_, D>) {
    if self.retaining {
      debug!(handle = %self, "Finished retaining");
      self.retaining = false;
      if self.started != self.retaining_started && !self.started {
        self.stop(cx);
      }
    }
    if self.started && self.have_data && !self.report_next_start {
      self.call_on_load_finished();
    }
  }

  pub(crate) fn report_start(&mut self) {
    if self.started && self.report_next_start {
      self.report_next_start = false;
      if self.have_data && !self.retaining {
        self.call_on_load_finished();
      }
    }
  }

  /// Ask the loader to cancel its current load.
  ///
  /// Only possible while started with a registered listener. Returns whether
  /// the loader accepted; an accepted cancellation comes back later as a
  /// cancellation delivery.
  pub(crate) fn cancel(&mut self, cx: &mut LoaderContext<'_, D>) -> bool {
    debug!(handle = %self, "Canceling");
    if self.started && self.listener_registered {
      return self.loader.cancel_load(cx);
    }
    false
  }

  pub(crate) fn abandon(&mut self, cx: &mut LoaderContext<'_, D>) {
    self.loader.abandon(cx);
  }

  /// Tear the handle down. Safe to call more than once.
  pub(crate) fn destroy(&mut self, cx: &mut LoaderContext<'_, D>) {
    if self.destroyed {
      return;
    }
    debug!(handle = %self, "Destroying");
    self.destroyed = true;

    let need_reset = std::mem::take(&mut self.delivered_data);
    if need_reset
      && self.have_data
      && let Some(callbacks) = &self.callbacks
    {
      debug!(handle = %self, "Resetting");
      let loader = &self.loader;
      if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callbacks.on_loader_reset(loader))) {
        error!(loader_id = %self.id, panic = %panic_message(payload), "on_loader_reset panicked");
      }
    }
    self.callbacks = None;
    self.data = None;
    self.have_data = false;

    if self.listener_registered {
      self.listener_registered = false;
      self.unregister();
    }
    self.loader.reset(cx);

    if let Some(mut pending) = self.pending.take() {
      pending.destroy(cx);
    }
  }

  /// Store a delivered result and hand it to the consumer if it is new and
  /// the handle is started.
  pub(crate) fn store_result(&mut self, data: D) {
    if self.have_data && self.data.as_ref() == Some(&data) {
      debug!(handle = %self, "Same data as before, not redelivering");
      return;
    }
    self.data = Some(data);
    self.have_data = true;
    if self.started {
      self.call_on_load_finished();
    }
  }

  pub(crate) fn call_on_load_finished(&mut self) {
    let (Some(callbacks), Some(data)) = (&self.callbacks, &self.data) else {
      return;
    };
    debug!(loader = %self.loader, "on_load_finished");
    let loader = &self.loader;
    match catch_unwind(AssertUnwindSafe(|| callbacks.on_load_finished(loader, data))) {
      Ok(()) => self.delivered_data = true,
      Err(payload) => error!(loader_id = %self.id, panic = %panic_message(payload), "on_load_finished panicked"),
    }
  }

  fn unregister(&mut self) {
    if let Err(error) = self.loader.unregister_listener(self.key) {
      warn!(loader_id = %self.id, %error, "Could not unregister listener");
    }
  }
}

impl<D> std::fmt::Display for LoaderHandle<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "LoaderInfo{{id={} loader={}}}", self.id, self.loader)
  }
}

impl<D> std::fmt::Debug for LoaderHandle<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LoaderHandle")
      .field("id", &self.id)
      .field("have_data", &self.have_data)
      .field("delivered_data", &self.delivered_data)
      .field("started", &self.started)
      .field("retaining", &self.retaining)
      .field("destroyed", &self.destroyed)
      .field("pending", &self.pending)
      .finish_non_exhaustive()
  }
}
