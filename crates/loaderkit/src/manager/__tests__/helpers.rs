//! Test helpers for manager scenarios.
//!
//! `Rig` owns a manager on a `ManualExecutor`, so every background load runs
//! only when a test says so. `Recorder` is the factory/consumer pair; all
//! recorders of one rig write into a shared event log.

use std::{
  cell::{Cell, RefCell},
  rc::Rc,
  sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  },
};

use tokio_util::sync::CancellationToken;

use crate::{
  LoadError, Loader, LoaderArgs, LoaderCallbacks, LoaderError, LoaderId, LoaderManager, ManualExecutor,
  ThrottledLoader,
};

/// What a consumer saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  Finished { id: u32, data: u32 },
  Reset { id: u32 },
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

/// Factory and consumer. Loaders it creates deliver `base + n` for the n-th
/// load they run.
pub struct Recorder {
  base: u32,
  log: EventLog,
  pub creates: Cell<u32>,
  pub fail_create: Cell<bool>,
  pub panic_on_finish: Cell<bool>,
  pub panic_on_reset: Cell<bool>,
}

impl Recorder {
  pub fn new(base: u32, log: EventLog) -> Rc<Self> {
    Rc::new(Self {
      base,
      log,
      creates: Cell::new(0),
      fail_create: Cell::new(false),
      panic_on_finish: Cell::new(false),
      panic_on_reset: Cell::new(false),
    })
  }
}

impl LoaderCallbacks<u32> for Recorder {
  fn on_create_loader(&self, id: LoaderId, _args: Option<&LoaderArgs>) -> Result<Loader<u32>, LoaderError> {
    if self.fail_create.get() {
      return Err(LoaderError::factory(id, "factory refused"));
    }
    self.creates.set(self.creates.get() + 1);
    let base = self.base;
    let loads = Arc::new(AtomicU32::new(0));
    let work = move |_: &CancellationToken| -> Result<u32, LoadError> {
      Ok(base + loads.fetch_add(1, Ordering::SeqCst) + 1)
    };
    Ok(ThrottledLoader::new(work).into_loader(id))
  }

  fn on_load_finished(&self, loader: &Loader<u32>, data: &u32) {
    if self.panic_on_finish.get() {
      panic!("consumer blew up");
    }
    self.log.borrow_mut().push(Event::Finished {
      id: loader.id().0,
      data: *data,
    });
  }

  fn on_loader_reset(&self, loader: &Loader<u32>) {
    if self.panic_on_reset.get() {
      panic!("reset blew up");
    }
    self.log.borrow_mut().push(Event::Reset { id: loader.id().0 });
  }
}

pub struct Rig {
  pub executor: Arc<ManualExecutor>,
  pub manager: LoaderManager<u32>,
  pub log: EventLog,
}

impl Rig {
  pub fn new(started: bool) -> Self {
    let executor = Arc::new(ManualExecutor::new());
    Self {
      manager: LoaderManager::new("test", started, executor.clone()),
      executor,
      log: EventLog::default(),
    }
  }

  pub fn recorder(&self, base: u32) -> Rc<Recorder> {
    Recorder::new(base, self.log.clone())
  }

  /// Run every queued job and dispatch its outcome until nothing is left.
  pub fn settle(&mut self) {
    loop {
      let ran = self.executor.run_all();
      let handled = self.manager.dispatch_pending();
      if ran == 0 && handled == 0 {
        break;
      }
    }
  }

  /// Run only the oldest queued job and dispatch what it produced.
  pub fn step(&mut self) {
    self.executor.run_next();
    self.manager.dispatch_pending();
  }

  /// Drain the event log.
  pub fn events(&self) -> Vec<Event> {
    self.log.borrow_mut().drain(..).collect()
  }
}

pub fn finished(id: u32, data: u32) -> Event {
  Event::Finished { id, data }
}

pub fn reset(id: u32) -> Event {
  Event::Reset { id }
}
