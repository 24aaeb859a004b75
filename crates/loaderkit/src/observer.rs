//! Content-change notifications from data sources to loaders.
//!
//! A [`ContentObserver`] is bound to one loader instance. It can be cloned and
//! sent to any thread; [`ContentObserver::notify_change`] posts a message to the
//! owning manager, which then calls [`Loader::on_content_changed`] on the owner
//! thread. Signals that arrive before the previous one was handled collapse
//! into one.
//!
//! [`ContentObservable`] is the source side: a list of observers notified
//! together.
//!
//! [`Loader::on_content_changed`]: crate::Loader::on_content_changed

use std::sync::{
  Arc, Mutex,
  atomic::{AtomicBool, AtomicU64, Ordering},
};

use tracing::trace;

use crate::{error::LoaderError, loader::LoaderId};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

type PostFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Forwards change notifications to one loader.
#[derive(Clone)]
pub struct ContentObserver {
  id: u64,
  loader: LoaderId,
  pending: Arc<AtomicBool>,
  post: PostFn,
}

impl ContentObserver {
  pub(crate) fn new(loader: LoaderId, pending: Arc<AtomicBool>, post: PostFn) -> Self {
    Self {
      id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
      loader,
      pending,
      post,
    }
  }

  pub fn loader_id(&self) -> LoaderId {
    self.loader
  }

  /// Signal that the loader's content changed.
  ///
  /// Returns false if the signal was folded into one that is still queued,
  /// or if the manager is gone.
  pub fn notify_change(&self) -> bool {
    if self.pending.swap(true, Ordering::AcqRel) {
      trace!(loader_id = %self.loader, "Change already queued");
      return false;
    }
    if (self.post)() {
      return true;
    }
    self.pending.store(false, Ordering::Release);
    false
  }
}

impl PartialEq for ContentObserver {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for ContentObserver {}

impl std::fmt::Debug for ContentObserver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ContentObserver")
      .field("id", &self.id)
      .field("loader", &self.loader)
      .field("pending", &self.pending.load(Ordering::Relaxed))
      .finish()
  }
}

/// A set of observers notified together when a data source changes.
#[derive(Debug, Default)]
pub struct ContentObservable {
  observers: Mutex<Vec<ContentObserver>>,
}

impl ContentObservable {
  pub fn new() -> Self {
    Self::default()
  }

  fn observers(&self) -> std::sync::MutexGuard<'_, Vec<ContentObserver>> {
    // A panic while holding the lock cannot leave the list half-updated.
    self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn register(&self, observer: &ContentObserver) -> Result<(), LoaderError> {
    let mut observers = self.observers();
    if observers.contains(observer) {
      return Err(LoaderError::invalid_state(format!(
        "Observer {} is already registered",
        observer.id
      )));
    }
    observers.push(observer.clone());
    Ok(())
  }

  pub fn unregister(&self, observer: &ContentObserver) -> Result<(), LoaderError> {
    let mut observers = self.observers();
    let Some(index) = observers.iter().position(|o| o == observer) else {
      return Err(LoaderError::invalid_state(format!("Observer {} was not registered", observer.id)));
    };
    observers.remove(index);
    Ok(())
  }

  pub fn unregister_all(&self) {
    self.observers().clear();
  }

  pub fn len(&self) -> usize {
    self.observers().len()
  }

  pub fn is_empty(&self) -> bool {
    self.observers().is_empty()
  }

  /// Notify every observer, most recently registered first. Returns how many
  /// signals were actually posted.
  pub fn notify_change(&self) -> usize {
    let observers = self.observers().clone();
    observers.iter().rev().filter(|o| o.notify_change()).count()
  }
}
